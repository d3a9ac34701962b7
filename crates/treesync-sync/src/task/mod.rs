//! Reconciliation tasks
//!
//! A [`Task`] reconciles the local and remote copies of one or two paths.
//! Its life is a straight line:
//!
//! ```text
//! created ──→ acquiring ──→ running ──→ releasing ──→ done
//!                 │                                    ▲
//!                 └──── redundant (absorbed) ──────────┘
//! ```
//!
//! While acquiring, the task waits for the index to lock its targets and
//! hand over their last known hashes. The running phase is one of the six
//! algorithms in the submodules; it returns the hashes to store. Releasing
//! writes them back (or forgets the local hash after a failure), and the
//! task then waits for the subtasks it spawned.
//!
//! Failures never escape as errors: they are reported through the
//! [`ErrorReporter`] and collected into the task's [`TaskResult`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use treesync_conflict::ConflictNamer;
use treesync_core::config::Config;
use treesync_core::domain::newtypes::{HashPair, RelPath};
use treesync_core::ports::{Container, ContainerError, ErrorCategory, ErrorReporter, RemoteInfo};

use crate::filesystem::{hash_bytes, LocalFiles};
use crate::index::{FollowUpSink, Fragment, IndexError, TaskKind, TaskRef, TaskTicket};
use crate::replica::{LocalReplica, ReplicaStatus};
use crate::scheduler::{InFlightSlot, Scheduler, TaskHandle};
use crate::{SyncError, SyncResult};

mod local_add;
mod local_remove;
mod moved;
mod remote_add;
mod remote_remove;
mod resync;

/// A task or subtask that did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    pub kind: TaskKind,
    pub paths: Vec<RelPath>,
    pub error: String,
}

impl std::fmt::Display for FailedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths: Vec<&str> = self.paths.iter().map(RelPath::as_str).collect();
        write!(f, "{} [{}]: {}", self.kind, paths.join(", "), self.error)
    }
}

/// Outcome of a task: `None` on success, else every failure in its tree
pub type TaskResult = Option<Vec<FailedTask>>;

// ============================================================================
// SyncContext
// ============================================================================

/// What every task needs to run: both sides, the scheduler and the reporter
///
/// Also receives the compensating tasks produced by index merges, which it
/// schedules with priority.
pub struct SyncContext {
    container: Arc<dyn Container>,
    replica: Arc<LocalReplica>,
    scheduler: Scheduler,
    reporter: Arc<dyn ErrorReporter>,
    quota_retry_delay: Duration,
    this: Weak<SyncContext>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("root", &self.replica.root())
            .field("status", &self.replica.status())
            .finish()
    }
}

impl SyncContext {
    /// Wires a context and registers it as the index's follow-up sink
    pub fn new(
        container: Arc<dyn Container>,
        replica: Arc<LocalReplica>,
        scheduler: Scheduler,
        reporter: Arc<dyn ErrorReporter>,
        config: &Config,
    ) -> Arc<Self> {
        let ctx = Arc::new_cyclic(|this: &Weak<SyncContext>| Self {
            container,
            replica,
            scheduler,
            reporter,
            quota_retry_delay: config.quota.retry_delay(),
            this: this.clone(),
        });
        let sink: Weak<dyn FollowUpSink> = ctx.this.clone();
        ctx.replica.index().set_follow_up_sink(sink);
        ctx
    }

    pub fn replica(&self) -> &Arc<LocalReplica> {
        &self.replica
    }

    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn files(&self) -> &LocalFiles {
        self.replica.files()
    }

    /// Schedules a task for `ticket`
    ///
    /// Returns `None` when the context is being torn down.
    pub fn spawn(&self, ticket: TaskRef, priority: bool) -> Option<TaskHandle> {
        let ctx = self.this.upgrade()?;
        Some(self.scheduler.add_task(Task::new(ticket, ctx), priority))
    }

    /// Uploads a local file
    ///
    /// # Returns
    /// The hash of the uploaded content and the new remote metadata, or
    /// `None` if the local file is gone
    async fn upload(&self, path: &RelPath) -> SyncResult<Option<(String, RemoteInfo)>> {
        let Some(content) = self.files().read(path).await? else {
            return Ok(None);
        };
        let local_hash = hash_bytes(&content);
        let info = self.container.upload(path, content).await?;
        if self.replica.status() == ReplicaStatus::QuotaExceeded {
            self.replica.set_status(ReplicaStatus::Started);
        }
        info!(path = %path, remote = %info.hash, "Uploaded");
        Ok(Some((local_hash, info)))
    }

    /// Downloads a remote file, `None` if it does not exist
    async fn download(&self, path: &RelPath) -> SyncResult<Option<(RemoteInfo, Vec<u8>)>> {
        match self.container.download(path).await {
            Ok(found) => Ok(Some(found)),
            Err(ContainerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remote metadata of a file, `None` if it does not exist
    async fn remote_info(&self, path: &RelPath) -> SyncResult<Option<RemoteInfo>> {
        match self.container.get_info_file(path).await {
            Ok(info) => Ok(Some(info)),
            Err(ContainerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a remote file; an already missing one is not an error
    async fn remove_remote(&self, path: &RelPath) -> SyncResult<()> {
        match self.container.remove_file(path).await {
            Ok(()) => {
                info!(path = %path, "Removed remote file");
                Ok(())
            }
            Err(ContainerError::NotFound(_)) => {
                debug!(path = %path, "Remote file already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn report(&self, ticket: &TaskTicket, error: &SyncError) {
        let category = if error.is_quota_exceeded() {
            ErrorCategory::Quota
        } else {
            match error {
                SyncError::Io(_) | SyncError::Container(_) => ErrorCategory::Io,
                _ => ErrorCategory::Sync,
            }
        };
        self.reporter
            .report(category, &format!("{}: {}", ticket, error));
    }
}

impl FollowUpSink for SyncContext {
    fn submit(&self, ticket: TaskRef) {
        let priority = ticket.is_prior();
        if self.spawn(ticket, priority).is_none() {
            warn!("Context dropped, compensating task discarded");
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// A reconciliation of the paths named by its ticket
pub struct Task {
    ticket: TaskRef,
    ctx: Arc<SyncContext>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("ticket", &self.ticket).finish()
    }
}

impl Task {
    pub fn new(ticket: TaskRef, ctx: Arc<SyncContext>) -> Self {
        Self { ticket, ctx }
    }

    pub fn ticket(&self) -> &TaskRef {
        &self.ticket
    }

    /// Drives the task to completion
    ///
    /// `slot` is given back once the locks are released and only subtasks
    /// remain to be awaited.
    #[instrument(skip(self, slot), fields(task = %self.ticket))]
    pub async fn run(self, slot: InFlightSlot) -> TaskResult {
        let ticket = &self.ticket;
        let ctx = &self.ctx;
        let replica = ctx.replica();

        if ticket.kind().is_upload() && replica.status() == ReplicaStatus::QuotaExceeded {
            info!(delay_secs = ctx.quota_retry_delay.as_secs(), "Out of quota, delaying upload");
            tokio::time::sleep(ctx.quota_retry_delay).await;
        }

        let fragment = match replica.acquire_index(ticket).await {
            Ok(fragment) => fragment,
            Err(IndexError::Redundant) => {
                debug!("Redundant, nothing to do");
                return None;
            }
            Err(e) => {
                let error = SyncError::from(e);
                warn!(error = %error, "Could not lock targets");
                ctx.report(ticket, &error);
                return Some(vec![self.failure(&error)]);
            }
        };

        let mut run = Run {
            ctx,
            ticket,
            fragment,
            subtasks: Vec::new(),
        };
        let outcome = match ticket.kind() {
            TaskKind::LocalAdd => local_add::run(&mut run).await,
            TaskKind::RemoteAdd => remote_add::run(&mut run).await,
            TaskKind::LocalRemove => local_remove::run(&mut run).await,
            TaskKind::RemoteRemove => remote_remove::run(&mut run).await,
            TaskKind::Move => moved::run(&mut run).await,
            TaskKind::Resync => resync::run(&mut run).await,
        };
        let subtasks = std::mem::take(&mut run.subtasks);

        let mut failures = Vec::new();
        match outcome {
            Ok(updates) => replica.release_index(ticket, updates.as_ref()),
            Err(error) => {
                for path in ticket.targets() {
                    replica.index().invalidate_local(path);
                }
                replica.release_index(ticket, None);

                if error.is_quota_exceeded() {
                    error!(error = %error, "Task failed, storage quota exceeded");
                    replica.set_status(ReplicaStatus::QuotaExceeded);
                } else {
                    warn!(error = %error, "Task failed");
                }
                ctx.report(ticket, &error);
                failures.push(self.failure(&error));
            }
        }

        if !subtasks.is_empty() {
            debug!(subtasks = subtasks.len(), "Awaiting subtasks");
            slot.give_back();
        }
        for handle in subtasks {
            let id = handle.task_id();
            match handle.await {
                Ok(None) => {}
                Ok(Some(nested)) => failures.extend(nested),
                Err(e) => {
                    warn!(subtask = %id, error = %e, "Subtask did not complete");
                    failures.push(FailedTask {
                        kind: ticket.kind(),
                        paths: ticket.targets().to_vec(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            None
        } else {
            Some(failures)
        }
    }

    fn failure(&self, error: &SyncError) -> FailedTask {
        FailedTask {
            kind: self.ticket.kind(),
            paths: self.ticket.targets().to_vec(),
            error: error.to_string(),
        }
    }
}

// ============================================================================
// Run - state shared by the algorithms
// ============================================================================

/// The running phase of a task
///
/// Holds the locked hashes and the handles of spawned subtasks. Each
/// algorithm returns the hashes to write back: `Some(map)` replaces every
/// hash under the task's targets, `None` leaves the index untouched.
pub(crate) struct Run<'a> {
    ctx: &'a Arc<SyncContext>,
    ticket: &'a TaskRef,
    fragment: Fragment,
    subtasks: Vec<TaskHandle>,
}

pub(crate) type Updates = Option<Fragment>;

impl Run<'_> {
    /// Hashes recorded for `path` when the lock was granted
    fn known(&self, path: &RelPath) -> HashPair {
        self.fragment.get(path).cloned().unwrap_or_default()
    }

    fn files(&self) -> &LocalFiles {
        self.ctx.files()
    }

    /// Schedules a subtask awaited once this task has released its locks
    fn spawn(&mut self, ticket: TaskTicket) {
        debug!(subtask = %ticket, "Spawning subtask");
        if let Some(handle) = self.ctx.spawn(ticket.share(), false) {
            self.subtasks.push(handle);
        }
    }

    /// Schedules a local-add of `path`
    fn push(&mut self, path: &RelPath, create_mode: bool) {
        self.spawn(TaskTicket::local_add(path.clone(), create_mode));
    }

    /// Keeps both versions of a file that changed on both sides
    ///
    /// The local file is renamed to a free conflict name and pushed as a
    /// new file; the remote content takes the original name.
    ///
    /// # Returns
    /// The hashes of the original path after the remote content is written
    async fn keep_both(
        &mut self,
        path: &RelPath,
        remote: RemoteInfo,
        content: &[u8],
    ) -> SyncResult<HashPair> {
        let files = self.files();
        let conflict = ConflictNamer::generate_unique(path, &Utc::now(), |candidate| {
            files.resolve(candidate).exists()
        });
        warn!(path = %path, conflict = %conflict, "Both sides changed, keeping a conflict copy");

        files.rename(path, &conflict).await?;
        let local_hash = files.write(path, content).await?;
        self.push(&conflict, true);
        Ok(HashPair::known(local_hash, remote.hash))
    }

    /// Writes downloaded remote content over the local file
    async fn take_remote(
        &self,
        path: &RelPath,
        remote: RemoteInfo,
        content: &[u8],
    ) -> SyncResult<HashPair> {
        let local_hash = self.files().write(path, content).await?;
        info!(path = %path, "Downloaded");
        Ok(HashPair::known(local_hash, remote.hash))
    }
}

/// A single-entry update map
fn single(path: &RelPath, hashes: HashPair) -> Updates {
    let mut updates = Fragment::new();
    updates.insert(path.clone(), hashes);
    Some(updates)
}
