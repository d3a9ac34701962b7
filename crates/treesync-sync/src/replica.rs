//! The local replica: sync root, hash index and status

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use treesync_core::config::Config;

use crate::filesystem::LocalFiles;
use crate::index::{Fragment, IndexError, IndexTree, TaskRef};
use crate::saver::{load_entries, IndexSaver};

/// Lifecycle state of a replica as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    #[default]
    Unknown,
    Started,
    Stopped,
    Paused,
    Error,
    /// The container refused an upload for lack of space
    QuotaExceeded,
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicaStatus::Unknown => "unknown",
            ReplicaStatus::Started => "started",
            ReplicaStatus::Stopped => "stopped",
            ReplicaStatus::Paused => "paused",
            ReplicaStatus::Error => "error",
            ReplicaStatus::QuotaExceeded => "quota_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// A local directory kept in sync with a container
///
/// Tasks reach the index only through [`acquire_index`](Self::acquire_index)
/// and [`release_index`](Self::release_index); every release schedules a
/// save of the index file.
#[derive(Debug)]
pub struct LocalReplica {
    files: LocalFiles,
    index: Arc<IndexTree>,
    saver: Arc<IndexSaver>,
    status: Mutex<ReplicaStatus>,
    exclude_hidden: bool,
}

impl LocalReplica {
    /// Creates a replica over `root` with an existing index
    pub fn new(root: &Path, index: IndexTree, config: &Config) -> Self {
        let index = Arc::new(index);
        let saver = IndexSaver::new(
            Arc::clone(&index),
            root.join(&config.index.file_name),
            config.index.clone(),
        );
        Self {
            files: LocalFiles::new(root),
            index,
            saver: Arc::new(saver),
            status: Mutex::new(ReplicaStatus::Unknown),
            exclude_hidden: config.sync.exclude_hidden_files,
        }
    }

    /// Opens the replica at `config.sync.root`, restoring its index file
    ///
    /// # Errors
    /// Returns an error if the index file exists but cannot be parsed
    pub async fn load(config: &Config) -> Result<Self> {
        let root = &config.sync.root;
        tokio::fs::create_dir_all(root).await?;
        let entries = load_entries(&root.join(&config.index.file_name)).await?;
        info!(root = %root.display(), entries = entries.len(), "Opening local replica");
        Ok(Self::new(root, IndexTree::from_entries(entries), config))
    }

    pub fn files(&self) -> &LocalFiles {
        &self.files
    }

    pub fn index(&self) -> &Arc<IndexTree> {
        &self.index
    }

    pub fn saver(&self) -> &Arc<IndexSaver> {
        &self.saver
    }

    pub fn root(&self) -> &Path {
        self.files.root()
    }

    /// Whether dotfiles are left out of synchronization
    pub fn excludes_hidden(&self) -> bool {
        self.exclude_hidden
    }

    /// Locks the targets of `ticket` and returns their hashes
    ///
    /// # Errors
    /// See [`IndexTree::acquire`]
    pub async fn acquire_index(&self, ticket: &TaskRef) -> Result<Fragment, IndexError> {
        self.index.acquire(ticket).await
    }

    /// Gives the locks of `ticket` back, storing `updates` if any
    #[instrument(skip(self, ticket, updates), fields(task = %ticket))]
    pub fn release_index(&self, ticket: &TaskRef, updates: Option<&Fragment>) {
        self.index.release(ticket, updates);
        if updates.is_some() {
            self.saver.trigger();
        }
    }

    pub fn status(&self) -> ReplicaStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: ReplicaStatus) {
        let mut guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard != status {
            if status == ReplicaStatus::QuotaExceeded {
                warn!(from = %*guard, "Replica out of quota");
            } else {
                info!(from = %*guard, to = %status, "Replica status changed");
            }
            *guard = status;
        }
    }

    /// Whether no task holds or waits on any path
    pub fn is_up_to_date(&self) -> bool {
        self.index.is_idle()
    }
}
