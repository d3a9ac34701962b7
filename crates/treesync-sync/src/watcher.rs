//! File watching and debounced change queue
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate to monitor the
//! sync root, converting raw OS events into [`ChangeEvent`] values keyed by
//! path relative to that root.
//!
//! The [`DebouncedChangeQueue`] collects rapid-fire events and coalesces them
//! so that downstream consumers only see the final state of a path after it has
//! been quiet for a configurable debounce window. [`tickets_for_event`] then
//! turns each settled event into the task tickets that reconcile it.
//!
//! ## Architecture
//!
//! ```text
//! inotify / fanotify
//!       │
//!       ▼
//!  FileWatcher  ──→  mpsc::channel  ──→  DebouncedChangeQueue  ──→  tickets_for_event  ──→  Scheduler
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use treesync_core::domain::newtypes::RelPath;

use crate::filesystem::LocalFiles;
use crate::filter::{is_hidden, is_path_allowed};
use crate::index::{IndexTree, TaskTicket};

/// Capacity of the channel between the notify callback and the consumer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// ChangeEvent
// ============================================================================

/// A filesystem change under the sync root
///
/// Decoupled from the `notify` crate's raw event types. Paths are relative
/// to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A new file or directory was created at the given path
    Created(RelPath),
    /// An existing file was modified (content or metadata changed)
    Modified(RelPath),
    /// A file or directory was deleted from the given path
    Deleted(RelPath),
    /// A file or directory was renamed/moved
    Renamed {
        /// The original path before the rename
        old: RelPath,
        /// The new path after the rename
        new: RelPath,
    },
}

impl ChangeEvent {
    /// Returns the primary path associated with this event
    ///
    /// For rename events, this returns the new (destination) path.
    pub fn path(&self) -> &RelPath {
        match self {
            ChangeEvent::Created(p) => p,
            ChangeEvent::Modified(p) => p,
            ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches the sync root recursively using the OS-native mechanism
///
/// On Linux this typically uses inotify. Events outside the root (which
/// notify may report for renames across the boundary) are mapped to a
/// creation or deletion of the side that lies inside.
///
/// ## Usage
///
/// ```ignore
/// let (mut watcher, mut rx) = FileWatcher::new(root.clone())?;
/// watcher.start()?;
/// while let Some(event) = rx.recv().await { /* ... */ }
/// ```
pub struct FileWatcher {
    /// The underlying notify watcher instance
    watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    /// Creates a watcher for `root`
    ///
    /// Nothing is watched until [`start`](FileWatcher::start) is called.
    ///
    /// # Returns
    /// The watcher and the receiver yielding its [`ChangeEvent`]s
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new(root: PathBuf) -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(EVENT_CHANNEL_CAPACITY);
        let callback_root = root.clone();

        info!(root = %root.display(), "Initializing file watcher");

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&callback_root, &event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send change event (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher, root }, rx))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts watching the root recursively
    ///
    /// # Errors
    /// Returns an error if the root cannot be watched (e.g., does not exist,
    /// insufficient permissions, or inotify watch limit reached)
    pub fn start(&mut self) -> Result<()> {
        info!(path = %self.root.display(), "Starting recursive watch");
        self.watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", self.root.display()))
    }

    /// Stops watching the root
    ///
    /// # Errors
    /// Returns an error if the root was not being watched
    pub fn stop(&mut self) -> Result<()> {
        info!(path = %self.root.display(), "Stopping watch");
        self.watcher
            .unwatch(&self.root)
            .with_context(|| format!("Failed to unwatch path: {}", self.root.display()))
    }
}

// ============================================================================
// Event mapping - notify::Event → ChangeEvent
// ============================================================================

fn relative(root: &Path, path: &Path) -> Option<RelPath> {
    match RelPath::from_absolute(root, path) {
        Ok(rel) if !rel.is_root() => Some(rel),
        _ => None,
    }
}

/// Converts a `notify::Event` into a `ChangeEvent` relative to `root`
///
/// Maps the notify event kinds as follows:
/// - `Create(*)` -> `ChangeEvent::Created`
/// - `Modify(Data(*))` and other `Modify(*)` -> `ChangeEvent::Modified`
/// - `Modify(Name(Both))` with 2 paths -> `ChangeEvent::Renamed`
/// - `Modify(Name(From))` -> `ChangeEvent::Deleted`
/// - `Modify(Name(To))` -> `ChangeEvent::Created`
/// - `Remove(*)` -> `ChangeEvent::Deleted`
///
/// Returns `None` for access events, events without paths and paths that
/// fall outside the root.
fn map_notify_event(root: &Path, event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;
    let first = || paths.first().and_then(|p| relative(root, p));

    let change = match &event.kind {
        EventKind::Create(_) => ChangeEvent::Created(first()?),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let old = paths.first().and_then(|p| relative(root, p));
            let new = paths.get(1).and_then(|p| relative(root, p));
            match (old, new) {
                (Some(old), Some(new)) => ChangeEvent::Renamed { old, new },
                (Some(old), None) => ChangeEvent::Deleted(old),
                (None, Some(new)) => ChangeEvent::Created(new),
                (None, None) => return None,
            }
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeEvent::Deleted(first()?),

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeEvent::Created(first()?),

        EventKind::Modify(_) => ChangeEvent::Modified(first()?),

        EventKind::Remove(_) => ChangeEvent::Deleted(first()?),

        _ => {
            trace!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };

    debug!(event = ?change, "Mapped notify event");
    Some(change)
}

// ============================================================================
// ChangeEvent → tasks
// ============================================================================

/// Whether changes to `path` are synchronized
pub fn is_watched(path: &RelPath, exclude_hidden: bool) -> bool {
    is_path_allowed(path) && !(exclude_hidden && is_hidden(path))
}

/// Tickets reconciling one settled change
///
/// Files map to a local-add, local-remove or move. Directories, which the
/// index never locks one file at a time, map to a resync of each affected
/// directory. A rename whose one side is filtered out degrades to a
/// creation or deletion of the other side.
pub async fn tickets_for_event(
    event: &ChangeEvent,
    files: &LocalFiles,
    index: &IndexTree,
    exclude_hidden: bool,
) -> Vec<TaskTicket> {
    match event {
        ChangeEvent::Created(path) => created(path, true, files, index, exclude_hidden).await,
        ChangeEvent::Modified(path) => created(path, false, files, index, exclude_hidden).await,
        ChangeEvent::Deleted(path) => deleted(path, index, exclude_hidden),
        ChangeEvent::Renamed { old, new } => {
            match (is_watched(old, exclude_hidden), is_watched(new, exclude_hidden)) {
                (false, false) => Vec::new(),
                (false, true) => created(new, true, files, index, exclude_hidden).await,
                (true, false) => deleted(old, index, exclude_hidden),
                (true, true) => {
                    if files.exists(new).await && !files.is_file(new).await {
                        vec![TaskTicket::resync(old.clone()), TaskTicket::resync(new.clone())]
                    } else {
                        vec![TaskTicket::moved(old.clone(), new.clone())]
                    }
                }
            }
        }
    }
}

async fn created(
    path: &RelPath,
    fresh: bool,
    files: &LocalFiles,
    index: &IndexTree,
    exclude_hidden: bool,
) -> Vec<TaskTicket> {
    if !is_watched(path, exclude_hidden) {
        return Vec::new();
    }
    if files.is_file(path).await {
        let create_mode = fresh || !index.contains(path);
        vec![TaskTicket::local_add(path.clone(), create_mode)]
    } else if files.exists(path).await {
        vec![TaskTicket::resync(path.clone())]
    } else {
        // Gone again before the event settled
        deleted(path, index, exclude_hidden)
    }
}

fn deleted(path: &RelPath, index: &IndexTree, exclude_hidden: bool) -> Vec<TaskTicket> {
    if !is_watched(path, exclude_hidden) {
        return Vec::new();
    }
    if index.is_directory(path) {
        vec![TaskTicket::resync(path.clone())]
    } else {
        vec![TaskTicket::local_remove(path.clone())]
    }
}

// ============================================================================
// DebouncedChangeQueue
// ============================================================================

/// Queue that coalesces rapid filesystem changes into debounced events
///
/// When multiple events arrive for the same path in quick succession,
/// only the latest event type is kept and its timestamp is reset. Events
/// are only emitted (via [`poll`](DebouncedChangeQueue::poll)) once they
/// have been quiet for longer than the configured debounce delay, in the
/// order they were last touched.
pub struct DebouncedChangeQueue {
    /// Pending changes keyed by path, storing the latest event and its timestamp
    pending: HashMap<RelPath, (ChangeEvent, Instant)>,
    /// Minimum quiet period before a change is considered settled
    debounce_delay: Duration,
}

impl DebouncedChangeQueue {
    /// Creates a new `DebouncedChangeQueue` with the given debounce delay
    ///
    /// # Arguments
    /// * `debounce_delay` - How long a path must be quiet before its event is emitted
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
        }
    }

    /// Inserts or updates a change event for the given path
    ///
    /// A rename is keyed by its destination; a creation pending on the
    /// source is folded into the rename's destination instead of being
    /// reported for a path that no longer exists.
    pub fn push(&mut self, event: ChangeEvent) {
        let event = match event {
            ChangeEvent::Renamed { old, new } => match self.pending.get(&old) {
                Some((ChangeEvent::Created(_), _)) => {
                    self.pending.remove(&old);
                    ChangeEvent::Created(new)
                }
                _ => ChangeEvent::Renamed { old, new },
            },
            other => other,
        };
        trace!(event = ?event, "Enqueuing change event");
        self.pending
            .insert(event.path().clone(), (event, Instant::now()));
    }

    /// Returns all changes that have been quiet for the debounce delay
    ///
    /// Settled events are removed from the pending queue and returned,
    /// oldest first. Events still within the debounce window stay pending.
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let settled_paths: Vec<RelPath> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= self.debounce_delay)
            .map(|(path, _)| path.clone())
            .collect();

        let mut settled: Vec<(ChangeEvent, Instant)> = settled_paths
            .iter()
            .filter_map(|path| self.pending.remove(path))
            .collect();
        settled.sort_by_key(|(_, at)| *at);

        if !settled.is_empty() {
            debug!(count = settled.len(), "Polled settled change events");
        }
        settled.into_iter().map(|(event, _)| event).collect()
    }

    /// Time until the oldest pending event settles, `None` when empty
    pub fn next_deadline(&self) -> Option<Duration> {
        let now = Instant::now();
        self.pending
            .values()
            .map(|(_, at)| (*at + self.debounce_delay).saturating_duration_since(now))
            .min()
    }

    /// Returns the number of pending (unsettled) events
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if there are no pending events
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use treesync_core::domain::newtypes::HashPair;

    use crate::index::TaskKind;

    fn rel(p: &str) -> RelPath {
        RelPath::new(p).unwrap()
    }

    fn notify_event(kind: EventKind, paths: &[&str]) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    // ------------------------------------------------------------------
    // DebouncedChangeQueue
    // ------------------------------------------------------------------

    #[test]
    fn test_push_coalesces_same_path() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(100));
        queue.push(ChangeEvent::Created(rel("a.txt")));
        queue.push(ChangeEvent::Modified(rel("a.txt")));
        queue.push(ChangeEvent::Modified(rel("b.txt")));
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn test_push_keeps_latest_event_type() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(0));

        queue.push(ChangeEvent::Created(rel("a.txt")));
        queue.push(ChangeEvent::Modified(rel("a.txt")));
        queue.push(ChangeEvent::Deleted(rel("a.txt")));

        std::thread::sleep(Duration::from_millis(10));
        let settled = queue.poll();
        assert_eq!(settled, vec![ChangeEvent::Deleted(rel("a.txt"))]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rename_of_pending_creation_becomes_creation() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(0));
        queue.push(ChangeEvent::Created(rel("draft.tmp1")));
        queue.push(ChangeEvent::Renamed {
            old: rel("draft.tmp1"),
            new: rel("report.txt"),
        });

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.poll(), vec![ChangeEvent::Created(rel("report.txt"))]);
    }

    #[test]
    fn test_rename_of_known_file_is_kept() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(0));
        queue.push(ChangeEvent::Modified(rel("a")));
        queue.push(ChangeEvent::Renamed {
            old: rel("a"),
            new: rel("b"),
        });
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn test_poll_returns_nothing_for_recent_events() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(60));
        queue.push(ChangeEvent::Created(rel("a.txt")));

        assert!(queue.poll().is_empty());
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.next_deadline().unwrap() > Duration::from_secs(50));
    }

    #[test]
    fn test_poll_partial_settlement_in_order() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50));

        queue.push(ChangeEvent::Created(rel("first.txt")));
        std::thread::sleep(Duration::from_millis(5));
        queue.push(ChangeEvent::Created(rel("second.txt")));
        std::thread::sleep(Duration::from_millis(60));
        queue.push(ChangeEvent::Created(rel("late.txt")));

        let settled = queue.poll();
        assert_eq!(
            settled,
            vec![
                ChangeEvent::Created(rel("first.txt")),
                ChangeEvent::Created(rel("second.txt")),
            ]
        );
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_coalescing_resets_timestamp() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50));

        queue.push(ChangeEvent::Created(rel("a.txt")));
        std::thread::sleep(Duration::from_millis(30));
        queue.push(ChangeEvent::Modified(rel("a.txt")));

        std::thread::sleep(Duration::from_millis(30));
        assert!(queue.poll().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.poll(), vec![ChangeEvent::Modified(rel("a.txt"))]);
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(100));
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
        assert!(queue.poll().is_empty());
    }

    // ------------------------------------------------------------------
    // Event mapping
    // ------------------------------------------------------------------

    #[test]
    fn test_map_create_and_modify() {
        let root = Path::new("/sync");
        let created = notify_event(
            EventKind::Create(notify::event::CreateKind::File),
            &["/sync/a.txt"],
        );
        assert_eq!(
            map_notify_event(root, &created),
            Some(ChangeEvent::Created(rel("a.txt")))
        );

        let modified = notify_event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            &["/sync/d/a.txt"],
        );
        assert_eq!(
            map_notify_event(root, &modified),
            Some(ChangeEvent::Modified(rel("d/a.txt")))
        );
    }

    #[test]
    fn test_map_rename_event() {
        let event = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/sync/old.txt", "/sync/new.txt"],
        );
        assert_eq!(
            map_notify_event(Path::new("/sync"), &event),
            Some(ChangeEvent::Renamed {
                old: rel("old.txt"),
                new: rel("new.txt"),
            })
        );
    }

    #[test]
    fn test_map_rename_across_root_boundary() {
        let root = Path::new("/sync");
        let moved_out = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/sync/a.txt", "/tmp/a.txt"],
        );
        assert_eq!(
            map_notify_event(root, &moved_out),
            Some(ChangeEvent::Deleted(rel("a.txt")))
        );

        let moved_in = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/sync/b.txt"],
        );
        assert_eq!(
            map_notify_event(root, &moved_in),
            Some(ChangeEvent::Created(rel("b.txt")))
        );
    }

    #[test]
    fn test_map_remove_event() {
        let event = notify_event(
            EventKind::Remove(notify::event::RemoveKind::File),
            &["/sync/a.txt"],
        );
        assert_eq!(
            map_notify_event(Path::new("/sync"), &event),
            Some(ChangeEvent::Deleted(rel("a.txt")))
        );
    }

    #[test]
    fn test_map_ignored_events() {
        let root = Path::new("/sync");
        let access = notify_event(
            EventKind::Access(notify::event::AccessKind::Read),
            &["/sync/a.txt"],
        );
        assert!(map_notify_event(root, &access).is_none());

        let no_paths = notify_event(EventKind::Create(notify::event::CreateKind::File), &[]);
        assert!(map_notify_event(root, &no_paths).is_none());

        let on_root = notify_event(EventKind::Modify(ModifyKind::Any), &["/sync"]);
        assert!(map_notify_event(root, &on_root).is_none());
    }

    // ------------------------------------------------------------------
    // Tickets
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_file_events_map_to_file_tasks() {
        let dir = TempDir::new().unwrap();
        let files = LocalFiles::new(dir.path());
        let index = IndexTree::from_entries([(rel("known.txt"), HashPair::known("l", "r"))]);
        files.write(&rel("known.txt"), b"k").await.unwrap();
        files.write(&rel("new.txt"), b"n").await.unwrap();

        let tickets =
            tickets_for_event(&ChangeEvent::Modified(rel("known.txt")), &files, &index, true).await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].kind(), TaskKind::LocalAdd);
        assert!(!tickets[0].create_mode());

        let tickets =
            tickets_for_event(&ChangeEvent::Modified(rel("new.txt")), &files, &index, true).await;
        assert!(tickets[0].create_mode());

        let tickets =
            tickets_for_event(&ChangeEvent::Deleted(rel("gone.txt")), &files, &index, true).await;
        assert_eq!(tickets[0].kind(), TaskKind::LocalRemove);

        let rename = ChangeEvent::Renamed {
            old: rel("known.txt"),
            new: rel("new.txt"),
        };
        let tickets = tickets_for_event(&rename, &files, &index, true).await;
        assert_eq!(tickets[0].kind(), TaskKind::Move);
        assert_eq!(tickets[0].destination(), Some(&rel("new.txt")));
    }

    #[tokio::test]
    async fn test_directory_events_map_to_resync() {
        let dir = TempDir::new().unwrap();
        let files = LocalFiles::new(dir.path());
        let index = IndexTree::from_entries([(rel("old/a"), HashPair::known("l", "r"))]);
        files.write(&rel("new/a"), b"a").await.unwrap();

        let tickets =
            tickets_for_event(&ChangeEvent::Deleted(rel("old")), &files, &index, true).await;
        assert_eq!(tickets[0].kind(), TaskKind::Resync);

        let rename = ChangeEvent::Renamed {
            old: rel("old"),
            new: rel("new"),
        };
        let tickets = tickets_for_event(&rename, &files, &index, true).await;
        let targets: Vec<_> = tickets.iter().map(|t| t.primary().clone()).collect();
        assert_eq!(targets, vec![rel("old"), rel("new")]);
        assert!(tickets.iter().all(|t| t.kind() == TaskKind::Resync));
    }

    #[tokio::test]
    async fn test_filtered_paths_are_dropped() {
        let dir = TempDir::new().unwrap();
        let files = LocalFiles::new(dir.path());
        let index = IndexTree::new();
        files.write(&rel(".hidden"), b"h").await.unwrap();
        files.write(&rel("doc.txt"), b"d").await.unwrap();

        let hidden = ChangeEvent::Created(rel(".hidden"));
        assert!(tickets_for_event(&hidden, &files, &index, true).await.is_empty());
        assert_eq!(tickets_for_event(&hidden, &files, &index, false).await.len(), 1);

        let atomic_write = ChangeEvent::Renamed {
            old: rel("doc.txt.treesync-tmp"),
            new: rel("doc.txt"),
        };
        let tickets = tickets_for_event(&atomic_write, &files, &index, true).await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].kind(), TaskKind::LocalAdd);
    }
}
