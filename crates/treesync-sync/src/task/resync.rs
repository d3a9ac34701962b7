//! Full reconciliation of a directory
//!
//! Holds the subtree lock only while listing: every file found is pushed,
//! every indexed file not found is removed, each through its own subtask.
//! The subtasks bypass the subtree lock, and their results are aggregated
//! into this task's.

use std::collections::BTreeSet;

use tracing::{debug, info};
use treesync_core::domain::newtypes::RelPath;

use super::{Run, Updates};
use crate::filesystem::EntryKind;
use crate::index::TaskTicket;
use crate::watcher::is_watched;
use crate::SyncResult;

pub(super) async fn run(run: &mut Run<'_>) -> SyncResult<Updates> {
    let directory = run.ticket.primary().clone();
    let exclude_hidden = run.ctx.replica().excludes_hidden();

    let mut unvisited: BTreeSet<RelPath> = run
        .fragment
        .iter()
        .filter(|(path, hashes)| !hashes.is_absent() && is_watched(path, exclude_hidden))
        .map(|(path, _)| path.clone())
        .collect();
    let indexed = unvisited.len();

    let mut found = Vec::new();
    let mut pending = vec![directory.clone()];
    while let Some(dir) = pending.pop() {
        let Some(entries) = run.files().list_dir(&dir).await? else {
            continue;
        };
        for (name, kind) in entries {
            let path = dir.join(&name)?;
            if !is_watched(&path, exclude_hidden) {
                continue;
            }
            match kind {
                EntryKind::Directory => pending.push(path),
                EntryKind::File => found.push(path),
            }
        }
    }

    for path in &found {
        let create_mode = !unvisited.remove(path);
        run.spawn(TaskTicket::local_add(path.clone(), create_mode).bypassing(directory.clone()));
    }
    for path in &unvisited {
        debug!(path = %path, "Indexed file no longer present");
        run.spawn(TaskTicket::local_remove(path.clone()).bypassing(directory.clone()));
    }

    info!(
        directory = %directory,
        indexed,
        found = found.len(),
        missing = unvisited.len(),
        "Directory scanned"
    );
    // The subtasks write their own hashes.
    Ok(None)
}
