//! Lock and merge engine over the node arena

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};
use treesync_core::domain::newtypes::{HashPair, RelPath};

use super::merge::{self, Cancellation, FollowUpRequest, HashState, Operation};
use super::node::{AcquireEvent, NodeArena, NodeId, NodeKind, Waiter};
use super::ticket::{TaskId, TaskKind, TaskRef, TaskTicket};
use super::{FollowUpSink, Fragment, IndexError};

/// Maximum number of paths a single task may lock
const MAX_TARGETS: usize = 2;

/// Result of one acquisition attempt
#[derive(Debug)]
enum Attempt {
    Acquired(Fragment),
    Waiting,
    Redundant,
}

/// Side effects accumulated while the tree is locked
#[derive(Default)]
struct Effects {
    /// Tickets whose held locks must be given back
    releases: Vec<TaskRef>,
    /// Compensating tasks to hand to the sink once the tree is unlocked
    follow_ups: Vec<TaskRef>,
    /// Nodes that may have become removable
    prune: Vec<NodeId>,
}

// ============================================================================
// IndexTree
// ============================================================================

/// Hash index with per-path locks
///
/// All state sits behind one mutex that is never held across an await
/// point. Waiting tasks are resumed through a channel when the path they
/// wait on is released.
pub struct IndexTree {
    state: Mutex<TreeState>,
    sink: RwLock<Option<Weak<dyn FollowUpSink>>>,
}

impl Default for IndexTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IndexTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTree")
            .field("nodes", &self.node_count())
            .finish()
    }
}

impl IndexTree {
    /// Creates an empty index
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TreeState::default()),
            sink: RwLock::new(None),
        }
    }

    /// Builds an index from persisted entries
    ///
    /// Entries whose path conflicts with an earlier one (a file standing
    /// where a directory is needed) are skipped.
    pub fn from_entries(entries: impl IntoIterator<Item = (RelPath, HashPair)>) -> Self {
        let tree = Self::new();
        {
            let mut state = tree.lock_state();
            for (path, hashes) in entries {
                if hashes.is_absent() {
                    continue;
                }
                match state.arena.get_or_insert(&path, false) {
                    Ok(id) if state.arena.get(id).is_some_and(|n| !n.is_directory()) => {
                        state.arena.set_hashes(id, hashes)
                    }
                    _ => warn!(path = %path, "Skipping conflicting index entry"),
                }
            }
        }
        tree
    }

    /// Registers the receiver of compensating tasks
    pub fn set_follow_up_sink(&self, sink: Weak<dyn FollowUpSink>) {
        let mut guard = self.sink.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(sink);
    }

    fn lock_state(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Locks every target of `ticket`
    ///
    /// Paths are taken in sorted order. The future completes once all of
    /// them are held and yields the hashes of the covered files.
    ///
    /// # Errors
    /// - `IndexError::Redundant` if a queued operation absorbed this one
    /// - `IndexError::PathKind` if a target does not match the tree layout
    #[instrument(skip(self, ticket), fields(task = %ticket))]
    pub async fn acquire(&self, ticket: &TaskRef) -> Result<Fragment, IndexError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (outcome, follow_ups) = {
            let mut state = self.lock_state();
            let mut effects = Effects::default();
            let outcome = state.attempt(ticket, &tx, &mut effects);
            if !matches!(outcome, Ok(Attempt::Acquired(_)) | Ok(Attempt::Waiting)) {
                effects.releases.push(ticket.clone());
            }
            state.settle(&mut effects);
            (outcome, effects.follow_ups)
        };
        drop(tx);
        self.dispatch(follow_ups);

        match outcome? {
            Attempt::Acquired(fragment) => {
                trace!(files = fragment.len(), "Acquired immediately");
                Ok(fragment)
            }
            Attempt::Redundant => {
                debug!("Absorbed by a queued operation");
                Err(IndexError::Redundant)
            }
            Attempt::Waiting => {
                trace!("Waiting for lock");
                match rx.recv().await {
                    Some(AcquireEvent::Granted(fragment)) => Ok(fragment),
                    Some(AcquireEvent::Cancelled { release_acquired }) => {
                        debug!(release_acquired, "Cancelled while waiting");
                        if release_acquired {
                            self.release(ticket, None);
                        }
                        Err(IndexError::Redundant)
                    }
                    Some(AcquireEvent::Failed(e)) => {
                        self.release(ticket, None);
                        Err(e)
                    }
                    None => Err(IndexError::Redundant),
                }
            }
        }
    }

    /// Unlocks every node held by `ticket` and wakes the next waiters
    ///
    /// # Arguments
    /// * `updates` - New hashes for the released subtrees. When set, every
    ///   file under a released path takes its value from the map (absent if
    ///   missing). When `None` the hashes are left untouched.
    #[instrument(skip(self, ticket, updates), fields(task = %ticket))]
    pub fn release(&self, ticket: &TaskRef, updates: Option<&Fragment>) {
        let follow_ups = {
            let mut state = self.lock_state();
            let mut effects = Effects::default();
            state.release_ticket(ticket, updates, &mut effects);
            state.settle(&mut effects);
            effects.follow_ups
        };
        self.dispatch(follow_ups);
    }

    fn dispatch(&self, follow_ups: Vec<TaskRef>) {
        if follow_ups.is_empty() {
            return;
        }
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);

        match sink {
            Some(sink) => {
                for ticket in follow_ups {
                    debug!(task = %ticket, "Submitting compensating task");
                    sink.submit(ticket);
                }
            }
            None => warn!(
                count = follow_ups.len(),
                "No scheduler attached, dropping compensating tasks"
            ),
        }
    }

    // ------------------------------------------------------------------
    // Hash maintenance
    // ------------------------------------------------------------------

    /// Forgets the local hash of a file (deferred while it is locked)
    pub fn invalidate_local(&self, path: &RelPath) {
        let mut state = self.lock_state();
        if let Some(id) = state.arena.lookup(path) {
            state.arena.invalidate_local(id);
            state.arena.remove_if_possible(id);
        }
    }

    /// Forgets the remote hash of a file (deferred while it is locked)
    pub fn invalidate_remote(&self, path: &RelPath) {
        let mut state = self.lock_state();
        if let Some(id) = state.arena.lookup(path) {
            state.arena.invalidate_remote(id);
            state.arena.remove_if_possible(id);
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn hashes(&self, path: &RelPath) -> Option<HashPair> {
        let state = self.lock_state();
        let id = state.arena.lookup(path)?;
        state.arena.hashes(id).cloned()
    }

    pub fn contains(&self, path: &RelPath) -> bool {
        self.lock_state().arena.lookup(path).is_some()
    }

    pub fn is_directory(&self, path: &RelPath) -> bool {
        let state = self.lock_state();
        state
            .arena
            .lookup(path)
            .and_then(|id| state.arena.get(id))
            .is_some_and(|n| n.is_directory())
    }

    pub fn is_locked(&self, path: &RelPath) -> bool {
        let state = self.lock_state();
        state
            .arena
            .lookup(path)
            .and_then(|id| state.arena.get(id))
            .is_some_and(|n| n.is_locked())
    }

    /// The task holding `path`, directly or through a subtree lock
    pub fn lock_holder(&self, path: &RelPath) -> Option<TaskId> {
        let state = self.lock_state();
        let id = state.arena.lookup(path)?;
        let owner = state.arena.get(id)?.lock_owner?;
        state.arena.get(owner)?.executing.as_ref().map(|t| t.id())
    }

    /// The task queued on `path`, if any
    pub fn waiting_task(&self, path: &RelPath) -> Option<TaskId> {
        let state = self.lock_state();
        let id = state.arena.lookup(path)?;
        state.arena.get(id)?.waiter.as_ref().map(|w| w.ticket.id())
    }

    /// Number of nodes, root included
    pub fn node_count(&self) -> usize {
        self.lock_state().arena.len()
    }

    /// Whether no node is locked or waited on
    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        let root = state.arena.root();
        state
            .arena
            .traverse(root, |_| true, |n| n.is_locked() || n.waiter.is_some())
            .next()
            .is_none()
    }

    /// Every file with at least one known hash
    pub fn export(&self) -> Fragment {
        let state = self.lock_state();
        let root = state.arena.root();
        state
            .arena
            .traverse(root, |_| true, |n| {
                n.as_file().is_some_and(|f| !f.hashes.is_absent())
            })
            .filter_map(|id| {
                let hashes = state.arena.hashes(id)?.clone();
                Some((state.arena.path_of(id), hashes))
            })
            .collect()
    }
}

// ============================================================================
// TreeState
// ============================================================================

#[derive(Default)]
struct TreeState {
    arena: NodeArena,
}

impl TreeState {
    fn holds(&self, id: NodeId, ticket: &TaskTicket) -> bool {
        let Some(node) = self.arena.get(id) else {
            return false;
        };
        node.lock_owner == Some(id)
            && node
                .executing
                .as_ref()
                .is_some_and(|t| t.id() == ticket.id())
    }

    fn hash_state(&self, id: NodeId) -> HashState {
        match self.arena.get(id) {
            Some(node) => HashState {
                local_known: !node.is_invalidated_local(),
                remote_known: !node.is_invalidated_remote(),
            },
            None => HashState {
                local_known: false,
                remote_known: false,
            },
        }
    }

    /// One pass over the targets of `ticket`
    ///
    /// Either every target ends up held, or the ticket is registered as the
    /// waiter of exactly one node, or the operation is redundant.
    fn attempt(
        &mut self,
        ticket: &TaskRef,
        notify: &mpsc::UnboundedSender<AcquireEvent>,
        effects: &mut Effects,
    ) -> Result<Attempt, IndexError> {
        let paths = ticket.acquisition_order();
        if paths.len() > MAX_TARGETS {
            return Err(IndexError::TooManyTargets(paths.len()));
        }
        let only_directory = ticket.kind().is_directory_op();
        let waiter = Waiter {
            ticket: ticket.clone(),
            notify: notify.clone(),
        };

        let mut locked = Vec::with_capacity(paths.len());
        for path in &paths {
            let id = self.arena.get_or_insert(path, only_directory)?;
            effects.prune.push(id);
            let is_directory = self.arena.node(id)?.is_directory();
            if is_directory != only_directory {
                return Err(IndexError::PathKind(path.clone()));
            }

            if self.holds(id, ticket) {
                locked.push((id, path));
                continue;
            }

            if self.has_queued_resync_above(id, ticket) {
                return Ok(Attempt::Redundant);
            }

            if let Some(queued) = self.arena.node(id)?.waiter.clone() {
                if queued.ticket.id() == ticket.id() {
                    return Ok(Attempt::Redundant);
                }
                return self.merge(id, path, queued, waiter, effects);
            }

            if let Some(owner) = self.blocking_ancestor(id, ticket) {
                self.enqueue(id, owner, waiter)?;
                return Ok(Attempt::Waiting);
            }

            if let Some(owner) = self.arena.node(id)?.lock_owner {
                let bypassed = owner != id && ticket.bypasses(&self.arena.path_of(owner));
                if !bypassed {
                    self.enqueue(id, owner, waiter)?;
                    return Ok(Attempt::Waiting);
                }
            }

            if is_directory {
                self.steal_descendant_waiters(id, ticket, effects);
                if let Some(blocker) = self.locked_descendant(id) {
                    return self.wait_for_subtree(id, blocker, waiter);
                }
                self.capture_subtree(id, ticket)?;
            } else {
                self.arena.lock(id, id, Some(ticket.clone()))?;
            }
            locked.push((id, path));
        }

        let mut fragment = Fragment::new();
        for (id, path) in locked {
            self.collect_fragment(id, path, &mut fragment);
        }
        Ok(Attempt::Acquired(fragment))
    }

    fn has_queued_resync_above(&self, id: NodeId, ticket: &TaskTicket) -> bool {
        if !ticket.kind().is_covered_by_rescan() {
            return false;
        }
        self.arena.ancestors(id).into_iter().any(|anc| {
            let waiter = self.arena.get(anc).and_then(|n| n.waiter.as_ref());
            waiter.is_some_and(|w| {
                w.ticket.kind() == TaskKind::Resync
                    && w.ticket.id() != ticket.id()
                    && !ticket.bypasses(&self.arena.path_of(anc))
            })
        })
    }

    /// The directory whose lock covers an ancestor of `id`
    fn blocking_ancestor(&self, id: NodeId, ticket: &TaskTicket) -> Option<NodeId> {
        self.arena.ancestors(id).into_iter().find_map(|anc| {
            let owner = self.arena.get(anc)?.lock_owner?;
            if ticket.bypasses(&self.arena.path_of(anc)) {
                return None;
            }
            let held_by_us = self
                .arena
                .get(owner)
                .and_then(|n| n.executing.as_ref())
                .is_some_and(|t| t.id() == ticket.id());
            (!held_by_us).then_some(owner)
        })
    }

    fn locked_descendant(&self, dir: NodeId) -> Option<NodeId> {
        self.arena
            .traverse(dir, |_| true, |n| n.is_locked())
            .find(|&n| n != dir)
    }

    /// Queues the operation of a whole-subtree lock behind `blocker`
    fn wait_for_subtree(
        &mut self,
        dir: NodeId,
        blocker: NodeId,
        waiter: Waiter,
    ) -> Result<Attempt, IndexError> {
        let blocker_node = self.arena.node(blocker)?;
        let owner = blocker_node.lock_owner.unwrap_or(blocker);
        let file_self_locked = owner == blocker && !blocker_node.is_directory();

        if file_self_locked {
            let already_waited = blocker_node
                .as_file()
                .is_some_and(|f| f.subtree_waiter.is_some());
            if already_waited {
                // Another directory waits on the same file: one of them is
                // an ancestor of the other and would have absorbed us.
                warn!(
                    path = %self.arena.path_of(dir),
                    "Subtree lock collides with another pending subtree lock"
                );
                return Ok(Attempt::Redundant);
            }
        }
        self.enqueue(dir, owner, waiter)?;
        Ok(Attempt::Waiting)
    }

    fn capture_subtree(&mut self, dir: NodeId, ticket: &TaskRef) -> Result<(), IndexError> {
        let descendants: Vec<NodeId> = self
            .arena
            .traverse(dir, |_| true, |_| true)
            .filter(|&n| n != dir)
            .collect();
        for node in descendants {
            self.arena.lock(node, dir, None)?;
        }
        if let Some(d) = self.arena.node_mut(dir)?.as_directory_mut() {
            d.locked_children = d.children.len();
        }
        self.arena.lock(dir, dir, Some(ticket.clone()))
    }

    /// Cancels queued operations made pointless by a rescan of `dir`
    fn steal_descendant_waiters(&mut self, dir: NodeId, ticket: &TaskTicket, effects: &mut Effects) {
        let victims: Vec<NodeId> = self
            .arena
            .traverse(dir, |_| true, |n| {
                n.waiter.as_ref().is_some_and(|w| {
                    w.ticket.id() != ticket.id() && w.ticket.kind().is_covered_by_rescan()
                })
            })
            .filter(|&n| n != dir)
            .collect();

        for id in victims {
            if let Some(waiter) = self.detach(id) {
                debug!(task = %waiter.ticket, "Superseded by directory rescan");
                cancel(waiter, true, effects);
                effects.prune.push(id);
            }
        }
    }

    /// Registers `waiter` on `id`, queued behind the lock of `blocker`
    fn enqueue(&mut self, id: NodeId, blocker: NodeId, waiter: Waiter) -> Result<(), IndexError> {
        self.arena.node(blocker)?;
        let prior = waiter.ticket.is_prior();
        trace!(
            path = %self.arena.path_of(id),
            blocker = %self.arena.path_of(blocker),
            prior,
            "Queued"
        );
        {
            let node = self.arena.node_mut(id)?;
            node.waiter = Some(waiter);
            node.waiting_for = Some(blocker);
        }

        match &mut self.arena.node_mut(blocker)?.kind {
            NodeKind::Directory(dir) => {
                if prior {
                    dir.waiting_nodes.push_front(id);
                } else {
                    dir.waiting_nodes.push_back(id);
                }
            }
            NodeKind::File(file) if blocker == id => file.self_waiting = true,
            NodeKind::File(file) => file.subtree_waiter = Some(id),
        }
        Ok(())
    }

    /// Unregisters the waiter of `id` from wherever it is queued
    fn detach(&mut self, id: NodeId) -> Option<Waiter> {
        let node = self.arena.get_mut(id)?;
        let waiter = node.waiter.take()?;
        let Some(blocker) = node.waiting_for.take() else {
            return Some(waiter);
        };

        match self.arena.get_mut(blocker).map(|n| &mut n.kind) {
            Some(NodeKind::Directory(dir)) => dir.waiting_nodes.retain(|&n| n != id),
            Some(NodeKind::File(file)) if blocker == id => file.self_waiting = false,
            Some(NodeKind::File(file)) => {
                if file.subtree_waiter == Some(id) {
                    file.subtree_waiter = None;
                }
            }
            None => {}
        }
        Some(waiter)
    }

    /// Applies the merge decision between the queued waiter of `id` and
    /// an incoming operation
    fn merge(
        &mut self,
        id: NodeId,
        path: &RelPath,
        queued: Waiter,
        incoming: Waiter,
        effects: &mut Effects,
    ) -> Result<Attempt, IndexError> {
        self.arena.node(id)?;
        let verdict = merge::decide(
            path,
            &Operation::of(&queued.ticket, path),
            &Operation::of(&incoming.ticket, path),
            self.hash_state(id),
        );
        debug!(
            path = %path,
            queued = %queued.ticket,
            incoming = %incoming.ticket,
            keep_new = verdict.keep_new,
            "Merging operations"
        );

        if verdict.invalidate_local {
            self.arena.invalidate_local(id);
        }
        if verdict.invalidate_remote {
            self.arena.invalidate_remote(id);
        }
        for other in &verdict.invalidate_remote_at {
            match self.arena.get_or_insert(other, false) {
                Ok(other_id) => self.arena.invalidate_remote(other_id),
                Err(e) => warn!(path = %other, error = %e, "Cannot invalidate"),
            }
        }
        if verdict.upgrade_queued_to_create {
            queued.ticket.upgrade_to_create();
        }

        for request in verdict.follow_ups {
            self.follow_up(request, &queued.ticket, effects);
        }

        if let Some(cancellation) = verdict.cancel_queued {
            if verdict.keep_new {
                // Same queue position, new occupant.
                self.arena.node_mut(id)?.waiter = Some(incoming);
            } else {
                self.detach(id);
            }
            cancel(queued, cancellation == Cancellation::ReleaseAcquired, effects);
        }

        if verdict.keep_new {
            Ok(Attempt::Waiting)
        } else {
            Ok(Attempt::Redundant)
        }
    }

    fn follow_up(&mut self, request: FollowUpRequest, cancelled: &TaskRef, effects: &mut Effects) {
        let ticket = match request {
            FollowUpRequest::Push(path) => TaskTicket::local_add(path, true).prioritized().share(),
            FollowUpRequest::Remove(path) => TaskTicket::local_remove(path).prioritized().share(),
            FollowUpRequest::Move {
                source,
                destination,
                inherit_locks,
            } => {
                let ticket = TaskTicket::moved(source, destination).prioritized().share();
                if inherit_locks {
                    self.inherit(cancelled, &ticket, effects);
                }
                ticket
            }
        };
        effects.follow_ups.push(ticket);
    }

    /// Hands the locks of `from` over to `to`
    ///
    /// Only done when the held paths are a prefix of the new ticket's
    /// acquisition order; otherwise they are released.
    fn inherit(&mut self, from: &TaskRef, to: &TaskRef, effects: &mut Effects) {
        let held: Vec<(RelPath, NodeId)> = from
            .acquisition_order()
            .into_iter()
            .filter_map(|p| {
                let id = self.arena.lookup(&p)?;
                self.holds(id, from).then_some((p, id))
            })
            .collect();

        let order = to.acquisition_order();
        let is_prefix = held.len() <= order.len()
            && held.iter().zip(order.iter()).all(|((p, _), q)| p == q);

        if is_prefix {
            for (path, id) in held {
                debug!(path = %path, from = %from, to = %to, "Lock inherited");
                if let Some(node) = self.arena.get_mut(id) {
                    node.executing = Some(to.clone());
                }
            }
        } else {
            effects.releases.push(from.clone());
        }
    }

    fn collect_fragment(&self, id: NodeId, path: &RelPath, fragment: &mut Fragment) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        match &node.kind {
            NodeKind::File(file) => {
                fragment.insert(path.clone(), file.hashes.clone());
            }
            NodeKind::Directory(_) => {
                for file in self.arena.files_under(id) {
                    if let Some(hashes) = self.arena.hashes(file) {
                        if !hashes.is_absent() {
                            fragment.insert(self.arena.path_of(file), hashes.clone());
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Release and wake-up
    // ------------------------------------------------------------------

    fn release_ticket(&mut self, ticket: &TaskRef, updates: Option<&Fragment>, effects: &mut Effects) {
        let mut freed = Vec::new();
        for path in ticket.acquisition_order() {
            let Some(id) = self.arena.lookup(&path) else {
                continue;
            };
            if !self.holds(id, ticket) {
                continue;
            }
            if let Some(updates) = updates {
                self.apply_updates(id, &path, updates);
            }
            self.arena.unlock(id);
            freed.push(id);
        }

        for &id in &freed {
            self.wake(id, effects);
        }
        for id in freed {
            let Some(node) = self.arena.get(id) else {
                continue;
            };
            if node.is_directory() {
                self.arena.prune_under(id);
            }
            effects.prune.push(id);
        }
    }

    fn apply_updates(&mut self, id: NodeId, path: &RelPath, updates: &Fragment) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        if !node.is_directory() {
            let hashes = updates.get(path).cloned().unwrap_or_default();
            self.arena.set_hashes(id, hashes);
            return;
        }

        for file in self.arena.files_under(id) {
            let file_path = self.arena.path_of(file);
            let hashes = updates.get(&file_path).cloned().unwrap_or_default();
            self.arena.set_hashes(file, hashes);
        }
        for (file_path, hashes) in updates.range(path.clone()..) {
            if !file_path.starts_with(path) {
                continue;
            }
            if self.arena.lookup(file_path).is_some() {
                continue;
            }
            match self.arena.get_or_insert(file_path, false) {
                Ok(file) => self.arena.set_hashes(file, hashes.clone()),
                Err(e) => warn!(path = %file_path, error = %e, "Dropping update"),
            }
        }
    }

    fn wake(&mut self, id: NodeId, effects: &mut Effects) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        if node.is_directory() {
            let queue = self
                .arena
                .get_mut(id)
                .and_then(|n| n.as_directory_mut())
                .map(|d| std::mem::take(&mut d.waiting_nodes))
                .unwrap_or_default();
            for waiting in queue {
                self.retry(waiting, effects);
            }
            return;
        }

        let self_waiting = self
            .arena
            .get_mut(id)
            .and_then(|n| n.as_file_mut())
            .is_some_and(|f| std::mem::take(&mut f.self_waiting));
        if self_waiting {
            self.retry(id, effects);
        }
        if self.arena.get(id).is_some_and(|n| !n.is_locked()) {
            let subtree = self
                .arena
                .get_mut(id)
                .and_then(|n| n.as_file_mut())
                .and_then(|f| f.subtree_waiter.take());
            if let Some(dir) = subtree {
                self.retry(dir, effects);
            }
        }
    }

    /// Runs the acquisition of the waiter registered on `id` again
    fn retry(&mut self, id: NodeId, effects: &mut Effects) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        if node.waiter.is_none() {
            return;
        }
        node.waiting_for = None;
        let Some(waiter) = node.waiter.take() else {
            return;
        };

        match self.attempt(&waiter.ticket, &waiter.notify, effects) {
            Ok(Attempt::Acquired(fragment)) => {
                trace!(task = %waiter.ticket, "Lock granted");
                if waiter.notify.send(AcquireEvent::Granted(fragment)).is_err() {
                    debug!(task = %waiter.ticket, "Waiter gone, releasing");
                    effects.releases.push(waiter.ticket);
                }
            }
            Ok(Attempt::Waiting) => {}
            Ok(Attempt::Redundant) => cancel(waiter, true, effects),
            Err(e) => {
                if waiter.notify.send(AcquireEvent::Failed(e)).is_err() {
                    effects.releases.push(waiter.ticket);
                }
            }
        }
    }

    /// Drains deferred releases and prunes what they left behind
    fn settle(&mut self, effects: &mut Effects) {
        while let Some(ticket) = effects.releases.pop() {
            self.release_ticket(&ticket, None, effects);
        }
        for id in std::mem::take(&mut effects.prune) {
            if self.arena.get(id).is_some() {
                self.arena.remove_if_possible(id);
            }
        }
    }
}

/// Tells a waiter it was superseded
///
/// The waiter normally gives its locks back itself; if it is gone, the
/// release is done on its behalf.
fn cancel(waiter: Waiter, release_acquired: bool, effects: &mut Effects) {
    let sent = waiter
        .notify
        .send(AcquireEvent::Cancelled { release_acquired })
        .is_ok();
    if !sent && release_acquired {
        effects.releases.push(waiter.ticket);
    }
}

// ============================================================================
// Unit tests
// ============================================================================
