//! Change dispatcher - turns debounced filesystem events into tasks
//!
//! The [`ChangeDispatcher`] sits between the
//! [`FileWatcher`](crate::watcher::FileWatcher) and the
//! [`Scheduler`](crate::scheduler::Scheduler). Raw events are coalesced by
//! a [`DebouncedChangeQueue`]; once a path has been quiet long enough its
//! event is mapped to tickets and the resulting tasks are scheduled.
//!
//! ## Flow
//!
//! ```text
//! FileWatcher ──→ mpsc::Receiver ──→ ChangeDispatcher ──→ Scheduler
//!                                        │
//!                                  DebouncedChangeQueue
//! ```
//!
//! Changes made while nothing was watching are caught by
//! [`initial_scan`], which diffs the container listing against the index
//! and then rescans the whole replica.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use treesync_core::domain::newtypes::RelPath;
use treesync_core::ports::RemoteFile;

use crate::index::{IndexTree, TaskTicket};
use crate::scheduler::TaskHandle;
use crate::task::{FailedTask, SyncContext};
use crate::watcher::{is_watched, tickets_for_event, ChangeEvent, DebouncedChangeQueue};

// ============================================================================
// Task outcomes
// ============================================================================

/// Logs the failures of a detached task once it finishes
///
/// Used for tasks nobody awaits: watcher-driven tasks and the startup scan.
pub fn log_outcome(handle: TaskHandle) {
    tokio::spawn(async move {
        let id = handle.task_id();
        match handle.await {
            Ok(None) => {}
            Ok(Some(failures)) => {
                for failure in failures {
                    warn!(task = %id, failure = %failure, "Task failed");
                }
            }
            Err(e) => debug!(task = %id, error = %e, "Task did not complete"),
        }
    });
}

/// Waits for every handle and gathers the failures
async fn collect_failures(handles: Vec<TaskHandle>) -> Vec<FailedTask> {
    let mut failures = Vec::new();
    for handle in handles {
        let id = handle.task_id();
        match handle.await {
            Ok(None) => {}
            Ok(Some(nested)) => failures.extend(nested),
            Err(e) => warn!(task = %id, error = %e, "Task did not complete"),
        }
    }
    failures
}

// ============================================================================
// Startup scan
// ============================================================================

/// Tickets pulling the remote changes the index has not seen
///
/// A listed file whose remote hash differs from the indexed one is fetched;
/// an indexed file with a known remote hash that is no longer listed was
/// deleted remotely.
pub fn remote_tickets(
    listing: &[RemoteFile],
    index: &IndexTree,
    exclude_hidden: bool,
) -> Vec<TaskTicket> {
    let mut tickets = Vec::new();
    let listed: BTreeSet<&RelPath> = listing.iter().map(|file| &file.name).collect();

    for file in listing {
        if !is_watched(&file.name, exclude_hidden) {
            continue;
        }
        let known = index.hashes(&file.name).and_then(|hashes| hashes.remote);
        if known.as_deref() != Some(file.hash.as_str()) {
            tickets.push(TaskTicket::remote_add(file.name.clone()));
        }
    }
    for (path, hashes) in index.export() {
        if hashes.remote.is_some() && !listed.contains(&path) && is_watched(&path, exclude_hidden) {
            tickets.push(TaskTicket::remote_remove(path));
        }
    }
    tickets
}

/// Reconciles everything that changed while the replica was not watched
///
/// Remote changes are pulled first and awaited, then the whole replica is
/// rescanned. Running them in this order keeps the pending rescan from
/// absorbing the remote tasks.
///
/// # Returns
/// Every task that failed
///
/// # Errors
/// Returns an error if the container cannot be listed
pub async fn initial_scan(ctx: &Arc<SyncContext>) -> anyhow::Result<Vec<FailedTask>> {
    let listing = ctx
        .container()
        .list_files()
        .await
        .context("Failed to list the container")?;
    let replica = ctx.replica();
    let tickets = remote_tickets(&listing, replica.index(), replica.excludes_hidden());
    info!(
        remote_files = listing.len(),
        remote_changes = tickets.len(),
        "Starting initial scan"
    );

    let handles = tickets
        .into_iter()
        .filter_map(|ticket| ctx.spawn(ticket.share(), false))
        .collect();
    let mut failures = collect_failures(handles).await;

    if let Some(handle) = ctx.spawn(TaskTicket::resync(RelPath::root()).share(), false) {
        failures.extend(collect_failures(vec![handle]).await);
    }
    info!(failures = failures.len(), "Initial scan finished");
    Ok(failures)
}

// ============================================================================
// ChangeDispatcher
// ============================================================================

/// Schedules reconciliation tasks from filesystem change events
pub struct ChangeDispatcher {
    /// Receiver for change events from the FileWatcher
    change_rx: mpsc::Receiver<ChangeEvent>,
    /// Debounced queue that coalesces rapid-fire events
    queue: DebouncedChangeQueue,
    ctx: Arc<SyncContext>,
    /// How often the queue is polled for settled events
    poll_interval: Duration,
}

impl std::fmt::Debug for ChangeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDispatcher")
            .field("pending", &self.queue.pending_count())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl ChangeDispatcher {
    /// Creates a new `ChangeDispatcher`
    ///
    /// # Arguments
    /// * `change_rx` - Channel receiver for filesystem change events
    /// * `ctx` - Context the scheduled tasks run in
    /// * `debounce_delay` - How long a path must be quiet before it is synced
    /// * `poll_interval` - How often to check the debounce queue for settled events
    pub fn new(
        change_rx: mpsc::Receiver<ChangeEvent>,
        ctx: Arc<SyncContext>,
        debounce_delay: Duration,
        poll_interval: Duration,
    ) -> Self {
        info!(
            debounce_ms = debounce_delay.as_millis() as u64,
            poll_ms = poll_interval.as_millis() as u64,
            "Creating change dispatcher"
        );
        Self {
            change_rx,
            queue: DebouncedChangeQueue::new(debounce_delay),
            ctx,
            poll_interval,
        }
    }

    /// Adds a change event to the debounced queue
    pub fn enqueue(&mut self, event: ChangeEvent) {
        self.queue.push(event);
    }

    /// Number of events still inside their debounce window
    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    /// Schedules a task for every settled event
    ///
    /// # Returns
    /// The handles of the scheduled tasks, in event order
    pub async fn dispatch_settled(&mut self) -> Vec<TaskHandle> {
        let settled = self.queue.poll();
        if settled.is_empty() {
            return Vec::new();
        }

        let replica = self.ctx.replica();
        let mut handles = Vec::new();
        for event in &settled {
            let tickets = tickets_for_event(
                event,
                replica.files(),
                replica.index(),
                replica.excludes_hidden(),
            )
            .await;
            debug!(event = ?event, tasks = tickets.len(), "Settled");
            for ticket in tickets {
                if let Some(handle) = self.ctx.spawn(ticket.share(), false) {
                    handles.push(handle);
                }
            }
        }
        info!(
            events = settled.len(),
            tasks = handles.len(),
            "Dispatched settled changes"
        );
        handles
    }

    /// Main event loop of the dispatcher
    ///
    /// Receives events into the debounce queue and periodically schedules
    /// the settled ones. Exits when `cancel` fires or the change channel is
    /// closed; in the latter case events that already settled are still
    /// dispatched.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!("Change dispatcher starting");

        let mut poll_timer = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(pending = self.queue.pending_count(), "Change dispatcher cancelled");
                    break;
                }

                event = self.change_rx.recv() => {
                    match event {
                        Some(change) => {
                            debug!(event = ?change, "Dispatcher received change event");
                            self.queue.push(change);
                        }
                        None => {
                            info!("Change channel closed, dispatcher shutting down");
                            for handle in self.dispatch_settled().await {
                                log_outcome(handle);
                            }
                            break;
                        }
                    }
                }

                _ = poll_timer.tick() => {
                    for handle in self.dispatch_settled().await {
                        log_outcome(handle);
                    }
                }
            }
        }

        info!("Change dispatcher stopped");
    }
}

// ============================================================================
// Unit tests
// ============================================================================
