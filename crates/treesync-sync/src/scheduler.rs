//! Worker pool driving tasks to completion
//!
//! A fixed number of OS threads share two queues behind one mutex and
//! condition variable:
//!
//! - `pending`: submitted tasks that have not started. Priority tasks go to
//!   the front.
//! - `resumable`: started tasks whose waker fired.
//!
//! A worker always prefers a resumable task. It starts a pending task only
//! while fewer than `max_in_flight` tasks are started and unfinished, which
//! keeps a scan of thousands of files from opening thousands of transfers.
//! A started task that is only waiting on tasks it submitted gives its
//! slot back through its [`InFlightSlot`], so parents never starve their
//! own subtasks.
//!
//! ```text
//! add_task ──→ pending ──┐
//!                        ├──→ worker: poll ──→ Ready ──→ TaskHandle
//! waker ────→ resumable ─┘          │
//!                 ▲                 └──→ Pending (waits for its waker)
//!                 └─────────────────────────┘
//! ```
//!
//! Polling happens inside the tokio runtime context given at construction,
//! so tasks may use tokio I/O and timers.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::JoinHandle;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace};
use treesync_core::config::SchedulerConfig;

use crate::index::TaskId;
use crate::task::{Task, TaskResult};

type BoxedRun = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// Why a task handle resolved without a task result
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler stopped before the task completed")]
    Stopped,

    #[error("task panicked: {0}")]
    Panicked(String),
}

/// What a [`TaskHandle`] resolves to
pub type TaskOutcome = Result<TaskResult, SchedulerError>;

// ============================================================================
// TaskHandle
// ============================================================================

/// Completion of a submitted task
///
/// Dropping the handle detaches the task; it still runs.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(SchedulerError::Stopped)))
    }
}

// ============================================================================
// InFlightSlot
// ============================================================================

/// The share of `max_in_flight` a started task occupies
///
/// Freed when the task completes, or earlier through
/// [`give_back`](InFlightSlot::give_back). A slot is freed at most once.
#[derive(Clone)]
pub struct InFlightSlot {
    held: Arc<AtomicBool>,
    pool: Weak<Shared>,
}

impl InFlightSlot {
    /// Frees the slot while the task keeps running
    ///
    /// Does nothing if the task has not started or already gave it back.
    pub fn give_back(&self) {
        if !self.held.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            let mut state = pool.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            trace!(in_flight = state.in_flight, "Slot given back");
            pool.signal.notify_one();
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for InFlightSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightSlot").field("held", &self.is_held()).finish()
    }
}

// ============================================================================
// Job
// ============================================================================

struct Job {
    label: String,
    future: Mutex<Option<BoxedRun>>,
    done: Mutex<Option<oneshot::Sender<TaskOutcome>>>,
    /// Set while the job sits in a queue; wakes are ignored meanwhile
    queued: AtomicBool,
    /// Set while the job counts toward `in_flight`
    holds_slot: Arc<AtomicBool>,
    pool: Weak<Shared>,
}

impl Job {
    fn complete(&self, outcome: TaskOutcome) {
        let sender = self.done.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            // The handle may have been dropped: detached task.
            let _ = sender.send(outcome);
        }
    }

    /// Drops the future and resolves the handle with `Stopped`
    ///
    /// A future being polled right now is left to its worker.
    fn abort(&self) {
        let future = match self.future.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
            Err(TryLockError::WouldBlock) => None,
        };
        drop(future);
        self.complete(Err(SchedulerError::Stopped));
    }
}

impl Wake for Job {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.pool.upgrade() {
            Some(pool) => pool.resume(Arc::clone(self)),
            None => self.abort(),
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Default)]
struct State {
    pending: VecDeque<Arc<Job>>,
    resumable: VecDeque<Arc<Job>>,
    in_flight: usize,
    running: bool,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    signal: Condvar,
    max_in_flight: usize,
    runtime: Handle,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resume(&self, job: Arc<Job>) {
        {
            let mut state = self.lock();
            if !state.stopped {
                state.resumable.push_back(job);
                self.signal.notify_one();
                return;
            }
        }
        job.abort();
    }

    /// Blocks until there is something to poll, `None` once stopped
    fn next_job(&self) -> Option<Arc<Job>> {
        let mut state = self.lock();
        loop {
            if !state.running {
                return None;
            }
            if let Some(job) = state.resumable.pop_front() {
                return Some(job);
            }
            if state.in_flight < self.max_in_flight {
                if let Some(job) = state.pending.pop_front() {
                    state.in_flight += 1;
                    job.holds_slot.store(true, Ordering::Release);
                    trace!(task = %job.label, in_flight = state.in_flight, "Starting task");
                    return Some(job);
                }
            }
            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn poll_job(&self, job: Arc<Job>) {
        job.queued.store(false, Ordering::Release);
        let _runtime = self.runtime.enter();
        let waker = Waker::from(Arc::clone(&job));
        let mut cx = Context::from_waker(&waker);

        let mut slot = job.future.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(future) = slot.as_mut() else {
            // Completed while this wake was queued
            return;
        };
        let outcome = match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) if self.lock().stopped => Err(SchedulerError::Stopped),
            Ok(Poll::Pending) => return,
            Ok(Poll::Ready(result)) => Ok(result),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task = %job.label, panic = %message, "Task panicked");
                Err(SchedulerError::Panicked(message))
            }
        };
        let finished = slot.take();
        drop(slot);
        drop(finished);

        if job.holds_slot.swap(false, Ordering::AcqRel) {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            self.signal.notify_one();
        }
        trace!(task = %job.label, "Task finished");
        job.complete(outcome);
    }

    fn worker_loop(self: Arc<Self>, index: usize) {
        debug!(worker = index, "Worker started");
        while let Some(job) = self.next_job() {
            self.poll_job(job);
        }
        debug!(worker = index, "Worker stopped");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Handle on a worker pool
///
/// Cheap to clone; every clone drives the same pool. Tasks may be added
/// before [`start`](Scheduler::start); they wait in the queue.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: usize,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("max_in_flight", &self.shared.max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Scheduler {
    /// Creates a stopped pool polling its tasks inside `runtime`
    pub fn new(config: &SchedulerConfig, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                signal: Condvar::new(),
                max_in_flight: config.max_in_flight.max(1),
                runtime,
            }),
            workers: config.workers.max(1),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawns the worker threads
    ///
    /// Calling it on a running pool does nothing.
    ///
    /// # Errors
    /// Returns an error if a thread cannot be spawned or the pool was stopped
    pub fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return Err(SchedulerError::Stopped);
            }
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        for index in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("treesync-worker-{index}"))
                .spawn(move || shared.worker_loop(index));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    error!(error = %e, "Failed to spawn worker thread");
                    drop(threads);
                    self.stop();
                    return Err(SchedulerError::Stopped);
                }
            }
        }
        info!(
            workers = self.workers,
            max_in_flight = self.shared.max_in_flight,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stops the workers
    ///
    /// Tasks that have not finished resolve with [`SchedulerError::Stopped`]:
    /// queued ones immediately, suspended ones when next woken. Worker
    /// threads are joined, except the calling one.
    pub fn stop(&self) {
        let drained: Vec<Arc<Job>> = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.running = false;
            state.stopped = true;
            self.shared.signal.notify_all();
            state.pending.drain(..).chain(state.resumable.drain(..)).collect()
        };
        for job in &drained {
            job.abort();
        }

        let threads: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() != current && handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!(dropped = drained.len(), "Scheduler stopped");
    }

    /// Queues a task
    ///
    /// # Arguments
    /// * `task` - The task to run
    /// * `priority` - Start before every task already queued
    ///
    /// # Returns
    /// A future resolving to the task's result
    pub fn add_task(&self, task: Task, priority: bool) -> TaskHandle {
        let ticket = Arc::clone(task.ticket());
        self.enqueue(
            ticket.id(),
            ticket.to_string(),
            |slot| Box::pin(task.run(slot)),
            priority,
        )
    }

    fn enqueue<F>(&self, id: TaskId, label: String, make: F, priority: bool) -> TaskHandle
    where
        F: FnOnce(InFlightSlot) -> BoxedRun,
    {
        let (tx, rx) = oneshot::channel();
        let holds_slot = Arc::new(AtomicBool::new(false));
        let slot = InFlightSlot {
            held: Arc::clone(&holds_slot),
            pool: Arc::downgrade(&self.shared),
        };
        let job = Arc::new(Job {
            label,
            future: Mutex::new(Some(make(slot))),
            done: Mutex::new(Some(tx)),
            queued: AtomicBool::new(true),
            holds_slot,
            pool: Arc::downgrade(&self.shared),
        });

        let rejected = {
            let mut state = self.shared.lock();
            if state.stopped {
                Some(job)
            } else {
                trace!(task = %job.label, priority, "Task queued");
                if priority {
                    state.pending.push_front(job);
                } else {
                    state.pending.push_back(job);
                }
                self.shared.signal.notify_one();
                None
            }
        };
        if let Some(job) = rejected {
            debug!(task = %job.label, "Scheduler stopped, task rejected");
            job.abort();
        }
        TaskHandle { id, rx }
    }

    /// Number of started, unfinished tasks
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    /// Number of tasks waiting to start
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }
}

// ============================================================================
// Unit tests
// ============================================================================
