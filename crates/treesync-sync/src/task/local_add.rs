//! Push a local change
//!
//! Runs when a file was created or modified locally. The common case,
//! content identical to what was last reconciled, finishes without any
//! network call.

use tracing::{debug, info};
use treesync_conflict::Divergence;
use treesync_core::domain::newtypes::{HashPair, RelPath};

use super::{single, Run, Updates};
use crate::filesystem::hash_bytes;
use crate::SyncResult;

pub(super) async fn run(run: &mut Run<'_>) -> SyncResult<Updates> {
    let path = run.ticket.primary().clone();
    let known = run.known(&path);

    let Some(local_hash) = run.files().hash(&path).await? else {
        if known.remote.is_some() {
            // Deleted again; the pending removal decides what happens remotely.
            debug!(path = %path, "Local file vanished, keeping known hashes");
            return Ok(single(&path, known));
        }
        debug!(path = %path, "Local file vanished, trying the remote copy");
        return match run.ctx.download(&path).await? {
            Some((remote, content)) => {
                Ok(single(&path, run.take_remote(&path, remote, &content).await?))
            }
            None => Ok(single(&path, HashPair::absent())),
        };
    };

    if known.remote.is_some() && known.local.as_deref() == Some(local_hash.as_str()) {
        debug!(path = %path, "Content unchanged");
        return Ok(single(&path, HashPair::new(Some(local_hash), known.remote)));
    }

    if known.remote.is_some() {
        let current = run.ctx.remote_info(&path).await?;
        let divergence = Divergence::classify(
            Some(local_hash.as_str()),
            &known,
            current.as_ref().map(|info| info.hash.as_str()),
        );
        let remote_untouched = current.is_none() || divergence == Divergence::LocalChanged;
        if remote_untouched {
            return upload(run, &path).await;
        }
    }

    // Remote side unknown or changed too: compare contents.
    match run.ctx.download(&path).await? {
        None => upload(run, &path).await,
        Some((remote, content)) => {
            if hash_bytes(&content) == local_hash {
                debug!(path = %path, "Both sides hold the same content");
                Ok(single(&path, HashPair::known(local_hash, remote.hash)))
            } else {
                let hashes = run.keep_both(&path, remote, &content).await?;
                Ok(single(&path, hashes))
            }
        }
    }
}

async fn upload(run: &Run<'_>, path: &RelPath) -> SyncResult<Updates> {
    match run.ctx.upload(path).await? {
        Some((local_hash, remote)) => Ok(single(path, HashPair::known(local_hash, remote.hash))),
        None => {
            info!(path = %path, "File removed before upload");
            Ok(single(path, HashPair::absent()))
        }
    }
}
