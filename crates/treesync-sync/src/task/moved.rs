//! Propagate a local rename
//!
//! A rename is replayed remotely as "upload the destination, then delete
//! the source", after checking that neither remote end holds content this
//! replica has never seen. When the local filesystem no longer matches the
//! rename (the source came back, the destination vanished) the two ends
//! are reconciled separately instead.

use chrono::Utc;
use tracing::{debug, info, warn};
use treesync_conflict::ConflictNamer;
use treesync_core::domain::newtypes::{HashPair, RelPath};

use super::{Run, Updates};
use crate::filesystem::hash_bytes;
use crate::index::{Fragment, TaskTicket};
use crate::SyncResult;

pub(super) async fn run(run: &mut Run<'_>) -> SyncResult<Updates> {
    let source = run.ticket.primary().clone();
    let Some(destination) = run.ticket.destination().cloned() else {
        return Ok(None);
    };

    if run.files().exists(&source).await {
        debug!(source = %source, "Source still present, reconciling both ends");
        run.push(&source, false);
        if run.files().is_file(&destination).await {
            run.push(&destination, false);
        } else {
            run.spawn(TaskTicket::local_remove(destination));
        }
        return Ok(None);
    }

    let Some(moved_hash) = run.files().hash(&destination).await? else {
        debug!(destination = %destination, "Destination gone, treating both ends as deleted");
        run.spawn(TaskTicket::local_remove(destination));
        run.spawn(TaskTicket::local_remove(source));
        return Ok(None);
    };

    let mut updates = Fragment::new();
    updates.insert(source.clone(), HashPair::absent());

    let remove_source = check_source(run, &source, &moved_hash, &mut updates).await?;
    let settled = check_destination(run, &destination, &moved_hash).await?;

    let destination_hashes = match settled {
        Some(hashes) => hashes,
        None => match run.ctx.upload(&destination).await? {
            Some((local_hash, remote)) => HashPair::known(local_hash, remote.hash),
            None => HashPair::absent(),
        },
    };
    if remove_source {
        run.ctx.remove_remote(&source).await?;
    }
    info!(source = %source, destination = %destination, "Move replayed remotely");

    updates.insert(destination, destination_hashes);
    Ok(Some(updates))
}

/// Checks the remote source before it is deleted
///
/// # Returns
/// Whether the remote source must be deleted. A source whose remote
/// content differs from the moved file is restored locally under its old
/// name and kept.
async fn check_source(
    run: &Run<'_>,
    source: &RelPath,
    moved_hash: &str,
    updates: &mut Fragment,
) -> SyncResult<bool> {
    let known = run.known(source);
    if let Some(known_remote) = &known.remote {
        match run.ctx.remote_info(source).await? {
            None => return Ok(false),
            Some(info) if info.hash == *known_remote => return Ok(true),
            Some(_) => {}
        }
    }

    let Some((remote, content)) = run.ctx.download(source).await? else {
        return Ok(false);
    };
    if hash_bytes(&content) == moved_hash {
        return Ok(true);
    }

    warn!(source = %source, "Remote source changed before the move, restoring it");
    let hashes = run.take_remote(source, remote, &content).await?;
    updates.insert(source.clone(), hashes);
    Ok(false)
}

/// Checks what the remote destination currently holds
///
/// # Returns
/// The destination's hashes when the remote already stores the moved
/// content, `None` when it still has to be uploaded. Unknown remote content
/// is saved to a conflict copy first.
async fn check_destination(
    run: &mut Run<'_>,
    destination: &RelPath,
    moved_hash: &str,
) -> SyncResult<Option<HashPair>> {
    let known = run.known(destination);
    let Some(info) = run.ctx.remote_info(destination).await? else {
        return Ok(None);
    };
    if known.remote.as_deref() == Some(info.hash.as_str()) {
        if known.local.as_deref() == Some(moved_hash) {
            return Ok(Some(HashPair::known(moved_hash, info.hash)));
        }
        // The version this replica replaced: overwrite it.
        return Ok(None);
    }

    let Some((remote, content)) = run.ctx.download(destination).await? else {
        return Ok(None);
    };
    if hash_bytes(&content) == moved_hash {
        return Ok(Some(HashPair::known(moved_hash, remote.hash)));
    }

    let files = run.files();
    let conflict = ConflictNamer::generate_unique(destination, &Utc::now(), |candidate| {
        files.resolve(candidate).exists()
    });
    warn!(
        destination = %destination,
        conflict = %conflict,
        "Move overwrites unknown remote content"
    );
    files.write(&conflict, &content).await?;
    run.push(&conflict, true);
    Ok(None)
}
