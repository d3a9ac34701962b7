//! Propagate a local deletion

use tracing::{debug, info};
use treesync_core::domain::newtypes::HashPair;

use super::{single, Run, Updates};
use crate::index::TaskTicket;
use crate::SyncResult;

pub(super) async fn run(run: &mut Run<'_>) -> SyncResult<Updates> {
    let path = run.ticket.primary().clone();
    let known = run.known(&path);

    if run.files().exists(&path).await {
        debug!(path = %path, "File is back, pushing it instead");
        run.push(&path, false);
        return Ok(None);
    }

    let Some(known_remote) = known.remote else {
        // Nothing proves the remote copy is the one deleted here.
        debug!(path = %path, "Remote state unknown, fetching it back");
        run.spawn(TaskTicket::remote_add(path));
        return Ok(None);
    };

    match run.ctx.remote_info(&path).await? {
        None => Ok(single(&path, HashPair::absent())),
        Some(current) if current.hash == known_remote => {
            run.ctx.remove_remote(&path).await?;
            Ok(single(&path, HashPair::absent()))
        }
        Some(_) => {
            info!(path = %path, "Remote copy changed since the deletion, restoring it");
            run.spawn(TaskTicket::remote_add(path));
            Ok(None)
        }
    }
}
