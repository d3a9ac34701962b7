//! Apply a remote deletion locally

use tracing::{debug, info};
use treesync_conflict::Divergence;
use treesync_core::domain::newtypes::HashPair;

use super::{single, Run, Updates};
use crate::SyncResult;

pub(super) async fn run(run: &mut Run<'_>) -> SyncResult<Updates> {
    let path = run.ticket.primary().clone();
    let known = run.known(&path);

    let Some(current) = run.files().hash(&path).await? else {
        return Ok(single(&path, HashPair::absent()));
    };

    if Divergence::side_changed(Some(current.as_str()), known.local.as_deref()) {
        // Local edits, or a never reconciled file, outlive the remote deletion.
        debug!(path = %path, "Local copy changed, pushing it back");
        run.push(&path, true);
        return Ok(None);
    }

    run.files().remove(&path).await?;
    info!(path = %path, "Removed local file");
    Ok(single(&path, HashPair::absent()))
}
