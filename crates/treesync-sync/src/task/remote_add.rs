//! Pull a remote change

use tracing::{debug, info};
use treesync_conflict::Divergence;
use treesync_core::domain::newtypes::HashPair;

use super::{single, Run, Updates};
use crate::filesystem::hash_bytes;
use crate::SyncResult;

pub(super) async fn run(run: &mut Run<'_>) -> SyncResult<Updates> {
    let path = run.ticket.primary().clone();
    let known = run.known(&path);

    let Some((remote, content)) = run.ctx.download(&path).await? else {
        // Never reconciled but present locally: the remote copy is what is missing.
        if known.local.is_none() && run.files().is_file(&path).await {
            info!(path = %path, "Remote file missing, uploading the local one");
            return Ok(match run.ctx.upload(&path).await? {
                Some((local_hash, remote)) => {
                    single(&path, HashPair::known(local_hash, remote.hash))
                }
                None => single(&path, HashPair::absent()),
            });
        }
        debug!(path = %path, "Remote file already gone");
        return Ok(single(&path, HashPair::absent()));
    };

    let current = run.files().hash(&path).await?;
    let Some(current) = current else {
        return Ok(single(&path, run.take_remote(&path, remote, &content).await?));
    };

    if !Divergence::side_changed(Some(current.as_str()), known.local.as_deref()) {
        // Local copy is the one last reconciled: overwrite it.
        return Ok(single(&path, run.take_remote(&path, remote, &content).await?));
    }

    if hash_bytes(&content) == current {
        debug!(path = %path, "Both sides hold the same content");
        return Ok(single(&path, HashPair::known(current, remote.hash)));
    }

    let hashes = run.keep_both(&path, remote, &content).await?;
    Ok(single(&path, hashes))
}
