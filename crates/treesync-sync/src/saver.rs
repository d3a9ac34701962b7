//! Debounced persistence of the hash index
//!
//! The index is stored as a flat JSON object mapping each relative path to
//! its `[local, remote]` hash pair, either side possibly `null`:
//!
//! ```json
//! { "docs/report.pdf": ["9f86d0...", "a1b2c3"], "notes.txt": [null, "d4e5f6"] }
//! ```
//!
//! Every release of an index lock calls [`IndexSaver::trigger`]. The
//! background [`IndexSaver::run`] loop waits for a quiet period before
//! writing, so a burst of completed tasks costs a single write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use treesync_core::config::IndexConfig;
use treesync_core::domain::newtypes::{HashPair, RelPath};

use crate::filter::TMP_SUFFIX;
use crate::index::IndexTree;

/// On-disk form of one entry
type StoredPair = [Option<String>; 2];

/// Reads a persisted index
///
/// A missing file yields an empty list.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or parsed
pub async fn load_entries(path: &Path) -> Result<Vec<(RelPath, HashPair)>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No index file, starting empty");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read index {}", path.display()))
        }
    };

    let stored: BTreeMap<RelPath, StoredPair> = serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse index {}", path.display()))?;

    info!(path = %path.display(), entries = stored.len(), "Loaded index");
    Ok(stored
        .into_iter()
        .map(|(path, [local, remote])| (path, HashPair::new(local, remote)))
        .collect())
}

/// Writes `index` to `path` atomically
async fn write_index(index: &IndexTree, path: &Path) -> Result<usize> {
    let stored: BTreeMap<RelPath, StoredPair> = index
        .export()
        .into_iter()
        .map(|(path, pair)| (path, [pair.local, pair.remote]))
        .collect();
    let json = serde_json::to_vec(&stored).context("Failed to serialize index")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(stored.len())
}

// ============================================================================
// IndexSaver
// ============================================================================

/// Schedules index writes
pub struct IndexSaver {
    index: Arc<IndexTree>,
    path: PathBuf,
    config: IndexConfig,
    dirty: AtomicBool,
    changed: Notify,
}

impl std::fmt::Debug for IndexSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSaver")
            .field("path", &self.path)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl IndexSaver {
    /// Creates a saver writing `index` to `path`
    pub fn new(index: Arc<IndexTree>, path: PathBuf, config: IndexConfig) -> Self {
        Self {
            index,
            path,
            config,
            dirty: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether changes are waiting to be written
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the index as changed and wakes the save loop
    pub fn trigger(&self) {
        self.dirty.store(true, Ordering::Release);
        self.changed.notify_one();
    }

    /// Writes the index now if it changed
    ///
    /// # Errors
    /// Returns an error if the write fails; the index stays dirty
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        match write_index(&self.index, &self.path).await {
            Ok(entries) => {
                debug!(entries, "Index saved");
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Background save loop
    ///
    /// After a change, waits for `save_delay` without further changes before
    /// writing. Each new change restarts the wait, at most `max_save_delays`
    /// times. Failed writes are retried `max_save_retries` times. Pending
    /// changes are flushed when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(path = %self.path.display(), "Index saver started");
        loop {
            tokio::select! {
                _ = self.changed.notified() => {}
                _ = cancel.cancelled() => break,
            }

            let mut delays = 0;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.save_delay()) => break,
                    _ = self.changed.notified() => {
                        delays += 1;
                        if delays >= self.config.max_save_delays {
                            debug!(delays, "Save postponed too many times, writing now");
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }

            self.save_with_retries(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }
        }

        if let Err(e) = self.flush().await {
            error!(error = %format!("{e:#}"), "Final index save failed");
        }
        info!("Index saver stopped");
    }

    async fn save_with_retries(&self, cancel: &CancellationToken) {
        let mut attempt = 0;
        loop {
            match self.flush().await {
                Ok(()) => return,
                Err(e) if attempt < self.config.max_save_retries && !cancel.is_cancelled() => {
                    attempt += 1;
                    warn!(attempt, error = %format!("{e:#}"), "Index save failed, retrying");
                    tokio::time::sleep(self.config.save_delay()).await;
                }
                Err(e) => {
                    error!(attempts = attempt + 1, error = %format!("{e:#}"), "Giving up on index save");
                    return;
                }
            }
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
