//! The local index
//!
//! Maps every known path to its last reconciled [`HashPair`] and serializes
//! the tasks acting on those paths. A task asks for its one or two target
//! paths with [`IndexTree::acquire`]; when every lock is granted it receives
//! the hashes of the locked files (a [`Fragment`]) and eventually hands the
//! updated hashes back with [`IndexTree::release`].
//!
//! Only one operation may wait on a given path. When a second one arrives,
//! [`merge::decide`] picks the survivor so that a burst of events on the same
//! file collapses into a single reconciliation.

use std::collections::BTreeMap;

use thiserror::Error;
use treesync_core::domain::newtypes::{HashPair, RelPath};

pub mod merge;
pub mod node;
pub mod ticket;
mod tree;

pub use merge::{Cancellation, FollowUpRequest, HashState, Operation, Verdict};
pub use ticket::{TaskId, TaskKind, TaskRef, TaskTicket};
pub use tree::IndexTree;

/// Hashes of every file covered by a set of locks, keyed by path
pub type Fragment = BTreeMap<RelPath, HashPair>;

/// Errors raised while acquiring or releasing index locks
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("a task may lock at most two paths, got {0}")]
    TooManyTargets(usize),

    #[error("path kind mismatch at {0}: a file stands where a directory is expected")]
    PathKind(RelPath),

    /// The operation was absorbed by another queued operation
    #[error("operation is redundant with a queued task")]
    Redundant,

    /// A node id outlived its node; the tree is left as it was
    #[error("stale node id {0:?}")]
    StaleNode(node::NodeId),
}

/// Receives the compensating tasks produced by merge decisions
///
/// Implemented by whatever owns the scheduler; the index only holds a weak
/// reference to it.
pub trait FollowUpSink: Send + Sync {
    /// Schedules a task for `ticket` ahead of regular work
    fn submit(&self, ticket: TaskRef);
}
