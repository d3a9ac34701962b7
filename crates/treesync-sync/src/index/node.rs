//! PathNode arena
//!
//! The synchronized namespace as a tree of [`PathNode`]s stored in a slab.
//! Nodes refer to their parent, their lock owner and the node they wait on
//! by [`NodeId`], never by reference, so the whole tree can sit behind one
//! mutex and be restructured freely between two lock acquisitions.
//!
//! ## Locking vocabulary
//!
//! - `lock_owner == Some(self)`: the node is locked for the task stored in
//!   `executing`.
//! - `lock_owner == Some(ancestor)`: the node was captured by the subtree
//!   lock of that ancestor directory.
//! - `waiter`: the one operation queued to act on this node, registered in
//!   the waiting queue of the node it is blocked by (`waiting_for`).

use std::collections::{BTreeMap, VecDeque};

use tokio::sync::mpsc;
use treesync_core::domain::newtypes::{HashPair, RelPath};

use super::ticket::TaskRef;
use super::{Fragment, IndexError};

// ============================================================================
// Identifiers and waiting entries
// ============================================================================

/// Stable key of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Message delivered to a suspended acquisition
#[derive(Debug)]
pub enum AcquireEvent {
    /// Every target is now locked for the task
    Granted(Fragment),
    /// The queued operation was superseded by a merge decision
    Cancelled {
        /// Whether locks the task already holds must be given back
        release_acquired: bool,
    },
    /// The retried acquisition failed
    Failed(IndexError),
}

/// A blocked task and the channel that resumes it
#[derive(Debug, Clone)]
pub struct Waiter {
    pub ticket: TaskRef,
    pub notify: mpsc::UnboundedSender<AcquireEvent>,
}

// ============================================================================
// Node types
// ============================================================================

#[derive(Debug, Default)]
pub struct DirectoryNode {
    pub children: BTreeMap<String, NodeId>,
    /// Nodes queued for this directory's lock, FIFO unless promoted
    pub waiting_nodes: VecDeque<NodeId>,
    /// Direct children captured by this directory's subtree lock
    pub locked_children: usize,
}

#[derive(Debug, Default)]
pub struct FileNode {
    pub hashes: HashPair,
    /// Ancestor directory waiting to fold this file into its subtree lock
    pub subtree_waiter: Option<NodeId>,
    /// This file's own waiter is queued on the file itself
    pub self_waiting: bool,
    /// Deferred invalidations, applied on unlock
    pub invalidate_local: bool,
    pub invalidate_remote: bool,
}

#[derive(Debug)]
pub enum NodeKind {
    Directory(DirectoryNode),
    File(FileNode),
}

#[derive(Debug)]
pub struct PathNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub lock_owner: Option<NodeId>,
    /// Set only while the node is its own lock owner
    pub executing: Option<TaskRef>,
    pub waiter: Option<Waiter>,
    pub waiting_for: Option<NodeId>,
    pub kind: NodeKind,
}

impl PathNode {
    fn new(name: String, parent: Option<NodeId>, kind: NodeKind) -> Self {
        Self {
            name,
            parent,
            lock_owner: None,
            executing: None,
            waiter: None,
            waiting_for: None,
            kind,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match &self.kind {
            NodeKind::File(file) => Some(file),
            NodeKind::Directory(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileNode> {
        match &mut self.kind {
            NodeKind::File(file) => Some(file),
            NodeKind::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match &self.kind {
            NodeKind::Directory(dir) => Some(dir),
            NodeKind::File(_) => None,
        }
    }

    pub fn as_directory_mut(&mut self) -> Option<&mut DirectoryNode> {
        match &mut self.kind {
            NodeKind::Directory(dir) => Some(dir),
            NodeKind::File(_) => None,
        }
    }

    /// Whether the node can be dropped from the tree
    ///
    /// Never for the root. A directory needs no children and no queued
    /// nodes; a file needs both hashes absent and no waiter of any kind.
    pub fn is_removable(&self) -> bool {
        if self.parent.is_none() || self.lock_owner.is_some() || self.waiter.is_some() {
            return false;
        }
        match &self.kind {
            NodeKind::Directory(dir) => dir.children.is_empty() && dir.waiting_nodes.is_empty(),
            NodeKind::File(file) => {
                file.hashes.is_absent() && file.subtree_waiter.is_none() && !file.self_waiting
            }
        }
    }

    /// Whether the local hash is (or will be, once unlocked) unknown
    pub fn is_invalidated_local(&self) -> bool {
        match (&self.kind, self.is_locked()) {
            (NodeKind::File(file), true) => file.invalidate_local,
            (NodeKind::File(file), false) => file.hashes.local.is_none(),
            (NodeKind::Directory(_), _) => false,
        }
    }

    /// Whether the remote hash is (or will be, once unlocked) unknown
    pub fn is_invalidated_remote(&self) -> bool {
        match (&self.kind, self.is_locked()) {
            (NodeKind::File(file), true) => file.invalidate_remote,
            (NodeKind::File(file), false) => file.hashes.remote.is_none(),
            (NodeKind::Directory(_), _) => false,
        }
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Slab of nodes rooted at an always-present directory
#[derive(Debug)]
pub struct NodeArena {
    slots: Vec<Option<PathNode>>,
    free: Vec<usize>,
    root: NodeId,
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeArena {
    pub fn new() -> Self {
        let root = PathNode::new(
            String::new(),
            None,
            NodeKind::Directory(DirectoryNode::default()),
        );
        Self {
            slots: vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    pub fn get(&self, id: NodeId) -> Option<&PathNode> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut PathNode> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Like [`get`](Self::get), a freed id being an error
    pub fn node(&self, id: NodeId) -> Result<&PathNode, IndexError> {
        self.get(id).ok_or(IndexError::StaleNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut PathNode, IndexError> {
        self.get_mut(id).ok_or(IndexError::StaleNode(id))
    }

    fn alloc(&mut self, node: PathNode) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Finds the node at `path` without creating anything
    pub fn lookup(&self, path: &RelPath) -> Option<NodeId> {
        let mut current = self.root;
        for part in path.parts() {
            current = *self.get(current)?.as_directory()?.children.get(part)?;
        }
        Some(current)
    }

    /// Walks to `path`, creating missing nodes on the way
    ///
    /// Intermediate nodes are directories. The last one is a file unless
    /// `only_directory` is set. An existing node of the other kind is
    /// returned as-is; a file in the middle of the path is an error.
    pub fn get_or_insert(
        &mut self,
        path: &RelPath,
        only_directory: bool,
    ) -> Result<NodeId, IndexError> {
        let parts: Vec<&str> = path.parts().collect();
        let mut current = self.root;

        for (i, part) in parts.iter().enumerate() {
            let is_last = i + 1 == parts.len();
            let existing = match &self.node(current)?.kind {
                NodeKind::Directory(dir) => dir.children.get(*part).copied(),
                NodeKind::File(_) => return Err(IndexError::PathKind(path.clone())),
            };

            current = match existing {
                Some(child) => child,
                None => {
                    let kind = if is_last && !only_directory {
                        NodeKind::File(FileNode::default())
                    } else {
                        NodeKind::Directory(DirectoryNode::default())
                    };
                    let child = self.alloc(PathNode::new(part.to_string(), Some(current), kind));
                    let parent = self.node_mut(current)?;
                    if let Some(dir) = parent.as_directory_mut() {
                        dir.children.insert(part.to_string(), child);
                    }
                    child
                }
            };
        }
        Ok(current)
    }

    /// Rebuilds the path of a node from its ancestors
    pub fn path_of(&self, id: NodeId) -> RelPath {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let Some(node) = self.get(node_id) else {
                break;
            };
            if node.parent.is_some() {
                parts.push(node.name.as_str());
            }
            current = node.parent;
        }
        parts.reverse();
        // Segments come from a valid path, re-parsing cannot fail.
        RelPath::new(parts.join("/")).unwrap_or_else(|_| RelPath::root())
    }

    /// Ancestors of a node, root first, the node itself excluded
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = self.get(id).and_then(|n| n.parent);
        while let Some(node_id) = current {
            chain.push(node_id);
            current = self.get(node_id).and_then(|n| n.parent);
        }
        chain.reverse();
        chain
    }

    /// Lazy depth-first walk starting at (and including) `start`
    ///
    /// Children are visited in name order. Files are emitted as they are
    /// reached, a directory after all of its explored descendants.
    /// `explore` decides whether a directory is descended into, `collect`
    /// whether a node is emitted.
    pub fn traverse<E, C>(&self, start: NodeId, explore: E, collect: C) -> Traverse<'_, E, C>
    where
        E: FnMut(&PathNode) -> bool,
        C: FnMut(&PathNode) -> bool,
    {
        Traverse {
            arena: self,
            stack: vec![Frame::Enter(start)],
            explore,
            collect,
        }
    }

    /// Every file below `start` (inclusive) with its path
    pub fn files_under(&self, start: NodeId) -> Vec<NodeId> {
        self.traverse(start, |_| true, |n| !n.is_directory()).collect()
    }

    // ------------------------------------------------------------------
    // Locks and hashes
    // ------------------------------------------------------------------

    /// Locks `id` on behalf of `owner`
    ///
    /// The executing task is recorded only when the node owns itself.
    pub fn lock(&mut self, id: NodeId, owner: NodeId, task: Option<TaskRef>) -> Result<(), IndexError> {
        let node = self.node_mut(id)?;
        node.lock_owner = Some(owner);
        node.executing = if owner == id { task } else { None };
        Ok(())
    }

    /// Unlocks `id`, releasing everything its subtree lock captured
    pub fn unlock(&mut self, id: NodeId) {
        let captured: Vec<NodeId> = if self.get(id).is_some_and(PathNode::is_directory) {
            self.traverse(id, |_| true, |n| n.lock_owner.is_some())
                .filter(|&n| n != id && self.get(n).is_some_and(|c| c.lock_owner == Some(id)))
                .collect()
        } else {
            Vec::new()
        };

        for node_id in captured {
            self.unlock_single(node_id);
        }
        self.unlock_single(id);
    }

    fn unlock_single(&mut self, id: NodeId) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        node.lock_owner = None;
        node.executing = None;
        match &mut node.kind {
            NodeKind::File(file) => {
                if std::mem::take(&mut file.invalidate_local) {
                    file.hashes.local = None;
                }
                if std::mem::take(&mut file.invalidate_remote) {
                    file.hashes.remote = None;
                }
            }
            NodeKind::Directory(dir) => dir.locked_children = 0,
        }
    }

    /// Forgets the local hash, after the current lock if there is one
    pub fn invalidate_local(&mut self, id: NodeId) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        let locked = node.is_locked();
        if let Some(file) = node.as_file_mut() {
            if locked {
                file.invalidate_local = true;
            } else {
                file.hashes.local = None;
            }
        }
    }

    /// Forgets the remote hash, after the current lock if there is one
    pub fn invalidate_remote(&mut self, id: NodeId) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        let locked = node.is_locked();
        if let Some(file) = node.as_file_mut() {
            if locked {
                file.invalidate_remote = true;
            } else {
                file.hashes.remote = None;
            }
        }
    }

    pub fn hashes(&self, id: NodeId) -> Option<&HashPair> {
        self.get(id)?.as_file().map(|file| &file.hashes)
    }

    pub fn set_hashes(&mut self, id: NodeId, hashes: HashPair) {
        if let Some(file) = self.get_mut(id).and_then(PathNode::as_file_mut) {
            file.hashes = hashes;
        }
    }

    // ------------------------------------------------------------------
    // Pruning
    // ------------------------------------------------------------------

    /// Removes `id` and then each ancestor, until one is not removable
    ///
    /// Returns the number of nodes dropped.
    pub fn remove_if_possible(&mut self, id: NodeId) -> usize {
        let mut removed = 0;
        let mut current = Some(id);
        while let Some(node_id) = current {
            let Some(node) = self.get(node_id) else {
                break;
            };
            if !node.is_removable() {
                break;
            }
            let parent = node.parent;
            let name = node.name.clone();
            if let Some(parent_id) = parent {
                if let Some(dir) = self.get_mut(parent_id).and_then(PathNode::as_directory_mut) {
                    dir.children.remove(&name);
                }
            }
            self.slots[node_id.0] = None;
            self.free.push(node_id.0);
            removed += 1;
            current = parent;
        }
        removed
    }

    /// Prunes every removable node below `start`, bottom-up
    pub fn prune_under(&mut self, start: NodeId) -> usize {
        let candidates: Vec<NodeId> = self
            .traverse(start, |_| true, |n| n.is_removable())
            .collect();
        let mut removed = 0;
        for id in candidates {
            if self.get(id).is_some() {
                removed += self.remove_if_possible(id);
            }
        }
        removed
    }
}

// ============================================================================
// Traversal
// ============================================================================

enum Frame {
    Enter(NodeId),
    Exit(NodeId),
}

/// Iterator returned by [`NodeArena::traverse`]
pub struct Traverse<'a, E, C> {
    arena: &'a NodeArena,
    stack: Vec<Frame>,
    explore: E,
    collect: C,
}

impl<'a, E, C> Iterator for Traverse<'a, E, C>
where
    E: FnMut(&PathNode) -> bool,
    C: FnMut(&PathNode) -> bool,
{
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    let Some(node) = self.arena.get(id) else {
                        continue;
                    };
                    match &node.kind {
                        NodeKind::File(_) => {
                            if (self.collect)(node) {
                                return Some(id);
                            }
                        }
                        NodeKind::Directory(dir) => {
                            self.stack.push(Frame::Exit(id));
                            if (self.explore)(node) {
                                // Reverse so the smallest name is popped first.
                                for child in dir.children.values().rev() {
                                    self.stack.push(Frame::Enter(*child));
                                }
                            }
                        }
                    }
                }
                Frame::Exit(id) => {
                    if let Some(node) = self.arena.get(id) {
                        if (self.collect)(node) {
                            return Some(id);
                        }
                    }
                }
            }
        }
        None
    }
}

// ============================================================================
// Unit tests
// ============================================================================
