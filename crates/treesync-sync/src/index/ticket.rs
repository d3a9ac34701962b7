//! Task tickets
//!
//! A [`TaskTicket`] is everything the index needs to know about a task:
//! its identity, its kind and the paths it wants. Tasks hold the ticket,
//! the index holds clones of the `Arc`. The index never holds anything
//! else belonging to a task.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use treesync_core::domain::newtypes::RelPath;
use uuid::Uuid;

/// Unique identifier of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// The closed set of reconciliation operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// A local file was created or modified
    LocalAdd,
    /// A remote file was created or modified
    RemoteAdd,
    /// A local file was deleted
    LocalRemove,
    /// A remote file was deleted
    RemoteRemove,
    /// A local file was renamed (source, destination)
    Move,
    /// A whole local directory must be rescanned
    Resync,
}

impl TaskKind {
    /// Whether the task locks a directory subtree instead of files
    pub fn is_directory_op(&self) -> bool {
        matches!(self, TaskKind::Resync)
    }

    /// Whether the task exists to push local content
    pub fn is_upload(&self) -> bool {
        matches!(self, TaskKind::LocalAdd | TaskKind::Move)
    }

    /// Whether a rescan of an enclosing directory does this task's work
    ///
    /// A rescan only reads the local side, so remote events and moves are
    /// never covered.
    pub fn is_covered_by_rescan(&self) -> bool {
        matches!(self, TaskKind::LocalAdd | TaskKind::LocalRemove | TaskKind::Resync)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::LocalAdd => "local_add",
            TaskKind::RemoteAdd => "remote_add",
            TaskKind::LocalRemove => "local_remove",
            TaskKind::RemoteRemove => "remote_remove",
            TaskKind::Move => "move",
            TaskKind::Resync => "resync",
        };
        write!(f, "{}", s)
    }
}

/// Identity and targets of a task, shared with the index
#[derive(Debug)]
pub struct TaskTicket {
    id: TaskId,
    kind: TaskKind,
    /// Targets in construction order: `[source, destination]` for moves
    targets: Vec<RelPath>,
    /// Local-add only: the file is new, not an update of a known file
    create_mode: AtomicBool,
    /// Compensating tasks jump ahead of regular waiters
    prior: bool,
    /// Ancestors of this directory (inclusive) never block the task
    bypass: Option<RelPath>,
}

/// Shared handle on a ticket
pub type TaskRef = Arc<TaskTicket>;

impl TaskTicket {
    fn new(kind: TaskKind, targets: Vec<RelPath>) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            targets,
            create_mode: AtomicBool::new(false),
            prior: false,
            bypass: None,
        }
    }

    pub fn local_add(path: RelPath, create_mode: bool) -> Self {
        let ticket = Self::new(TaskKind::LocalAdd, vec![path]);
        ticket.create_mode.store(create_mode, Ordering::Release);
        ticket
    }

    pub fn remote_add(path: RelPath) -> Self {
        Self::new(TaskKind::RemoteAdd, vec![path])
    }

    pub fn local_remove(path: RelPath) -> Self {
        Self::new(TaskKind::LocalRemove, vec![path])
    }

    pub fn remote_remove(path: RelPath) -> Self {
        Self::new(TaskKind::RemoteRemove, vec![path])
    }

    pub fn moved(source: RelPath, destination: RelPath) -> Self {
        Self::new(TaskKind::Move, vec![source, destination])
    }

    pub fn resync(directory: RelPath) -> Self {
        Self::new(TaskKind::Resync, vec![directory])
    }

    /// Marks the ticket as a compensating task
    pub fn prioritized(mut self) -> Self {
        self.prior = true;
        self
    }

    /// Lets the task ignore locks held on `parent` and its ancestors
    pub fn bypassing(mut self, parent: RelPath) -> Self {
        self.bypass = Some(parent);
        self
    }

    pub fn share(self) -> TaskRef {
        Arc::new(self)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn targets(&self) -> &[RelPath] {
        &self.targets
    }

    /// First target: the file, the directory, or a move's source
    pub fn primary(&self) -> &RelPath {
        &self.targets[0]
    }

    /// A move's destination
    pub fn destination(&self) -> Option<&RelPath> {
        match self.kind {
            TaskKind::Move => self.targets.get(1),
            _ => None,
        }
    }

    pub fn create_mode(&self) -> bool {
        self.create_mode.load(Ordering::Acquire)
    }

    /// Promotes a queued local-add to creation mode
    pub fn upgrade_to_create(&self) {
        self.create_mode.store(true, Ordering::Release);
    }

    pub fn is_prior(&self) -> bool {
        self.prior
    }

    pub fn bypass(&self) -> Option<&RelPath> {
        self.bypass.as_ref()
    }

    /// Whether a lock on `ancestor` is ignored by this task
    pub fn bypasses(&self, ancestor: &RelPath) -> bool {
        self.bypass
            .as_ref()
            .is_some_and(|bypass| bypass.starts_with(ancestor))
    }

    /// Targets in acquisition order (sorted, deduplicated)
    pub fn acquisition_order(&self) -> Vec<RelPath> {
        let mut paths = self.targets.clone();
        paths.sort();
        paths.dedup();
        paths
    }
}

impl fmt::Display for TaskTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)?;
        for target in &self.targets {
            write!(f, " {}", target)?;
        }
        Ok(())
    }
}
