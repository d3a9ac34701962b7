//! TreeSync Sync - Path-locking index and task scheduling engine
//!
//! Provides:
//! - A hash index with per-path and whole-subtree locks
//! - Merging of concurrent operations queued on the same path
//! - The six reconciliation task kinds and their three-way diff
//! - A bounded worker pool driving tasks to completion
//!
//! ## Modules
//!
//! - [`index`] - PathNode arena, lock/merge engine and task tickets
//! - [`task`] - Task lifecycle and the reconciliation algorithms
//! - [`scheduler`] - Worker pool with an in-flight cap
//! - [`replica`] - Local replica: sync root, index and status
//! - [`saver`] - Debounced, atomic persistence of the index
//! - [`filesystem`] - Local filesystem adapter (atomic writes, SHA-256)
//! - [`container_dir`] - Directory-backed [`Container`](treesync_core::ports::Container)
//! - [`filter`] - Paths that are never synchronized
//! - [`watcher`] - inotify-based change detection
//! - [`dispatch`] - Debounced watcher events turned into tasks

pub mod container_dir;
pub mod dispatch;
pub mod filesystem;
pub mod filter;
pub mod index;
pub mod replica;
pub mod saver;
pub mod scheduler;
pub mod task;
pub mod watcher;

use thiserror::Error;
use treesync_core::domain::errors::DomainError;
use treesync_core::ports::ContainerError;

pub use dispatch::{initial_scan, log_outcome, ChangeDispatcher};
pub use index::{IndexError, IndexTree, TaskKind, TaskRef, TaskTicket};
pub use replica::{LocalReplica, ReplicaStatus};
pub use scheduler::{InFlightSlot, Scheduler, SchedulerError, TaskHandle, TaskOutcome};
pub use task::{FailedTask, SyncContext, Task, TaskResult};

/// Errors that can occur while reconciling a path
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred on the local side
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote container failed
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// The index refused the operation
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// A domain-level error propagated from treesync-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The task could not be driven to completion
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

impl SyncError {
    /// Whether the failure comes from an exhausted storage quota
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, SyncError::Container(ContainerError::QuotaExceeded))
    }
}

/// Result alias for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
