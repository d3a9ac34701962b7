//! Merging of concurrent operations on one path
//!
//! When a task wants a path on which another task is already queued, only
//! one of them may stay queued. [`decide`] is a pure function of the two
//! operations and of what the index knows about the file's hashes; it never
//! looks at timing, so the same pair always merges the same way.
//!
//! Vocabulary used below:
//! - *replace*: the incoming operation takes the queued one's place in the
//!   waiting queue, the queued task is cancelled and gives back its locks.
//! - *discard*: the queued operation stays, the incoming task is redundant.

use treesync_core::domain::newtypes::RelPath;

use super::ticket::{TaskKind, TaskTicket};

/// What an operation intends to do on one specific path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    LocalAdd { create: bool },
    LocalRemove,
    RemoteAdd,
    RemoteRemove,
    /// The path is the source of a move to `destination`
    MoveSource { destination: RelPath },
    /// The path is the destination of a move from `source`
    MoveDestination { source: RelPath },
    Resync,
}

impl Operation {
    /// The operation `ticket` performs on `path`
    pub fn of(ticket: &TaskTicket, path: &RelPath) -> Self {
        match ticket.kind() {
            TaskKind::LocalAdd => Operation::LocalAdd {
                create: ticket.create_mode(),
            },
            TaskKind::LocalRemove => Operation::LocalRemove,
            TaskKind::RemoteAdd => Operation::RemoteAdd,
            TaskKind::RemoteRemove => Operation::RemoteRemove,
            TaskKind::Resync => Operation::Resync,
            TaskKind::Move => {
                let source = ticket.primary();
                let destination = ticket.destination().unwrap_or(source);
                if path == source {
                    Operation::MoveSource {
                        destination: destination.clone(),
                    }
                } else {
                    Operation::MoveDestination {
                        source: source.clone(),
                    }
                }
            }
        }
    }

    fn is_local(&self) -> bool {
        matches!(self, Operation::LocalAdd { .. } | Operation::LocalRemove)
    }

    fn is_remote(&self) -> bool {
        matches!(self, Operation::RemoteAdd | Operation::RemoteRemove)
    }

    fn is_move(&self) -> bool {
        matches!(
            self,
            Operation::MoveSource { .. } | Operation::MoveDestination { .. }
        )
    }
}

/// Whether each side of the file's hash pair is currently trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashState {
    pub local_known: bool,
    pub remote_known: bool,
}

impl HashState {
    pub fn known() -> Self {
        Self {
            local_known: true,
            remote_known: true,
        }
    }
}

/// How a cancelled queued task treats the locks it already holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// Give every held lock back to the index
    ReleaseAcquired,
    /// Leave them in place, a follow-up task inherits them
    KeepAcquired,
}

/// A compensating task requested by a merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpRequest {
    /// Re-upload the local state of a path (local add in creation mode)
    Push(RelPath),
    /// Propagate a local deletion
    Remove(RelPath),
    /// Replay a move, optionally taking over the cancelled task's locks
    Move {
        source: RelPath,
        destination: RelPath,
        inherit_locks: bool,
    },
}

/// Outcome of merging an incoming operation with a queued one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    /// The incoming operation becomes the path's waiter
    pub keep_new: bool,
    /// The queued operation is dropped
    pub cancel_queued: Option<Cancellation>,
    /// The queued local add must run in creation mode
    pub upgrade_queued_to_create: bool,
    /// Forget the local hash of the contested path
    pub invalidate_local: bool,
    /// Forget the remote hash of the contested path
    pub invalidate_remote: bool,
    /// Forget the remote hash of these other paths
    pub invalidate_remote_at: Vec<RelPath>,
    pub follow_ups: Vec<FollowUpRequest>,
}

impl Verdict {
    fn discard() -> Self {
        Self::default()
    }

    fn replace() -> Self {
        Self {
            keep_new: true,
            cancel_queued: Some(Cancellation::ReleaseAcquired),
            ..Self::default()
        }
    }

    fn invalidating_local(mut self) -> Self {
        self.invalidate_local = true;
        self
    }

    fn invalidating_remote(mut self) -> Self {
        self.invalidate_remote = true;
        self
    }

    fn invalidating_remote_at(mut self, path: &RelPath) -> Self {
        self.invalidate_remote_at.push(path.clone());
        self
    }

    fn then(mut self, request: FollowUpRequest) -> Self {
        self.follow_ups.push(request);
        self
    }

    /// Whether the incoming operation is absorbed
    pub fn is_redundant(&self) -> bool {
        !self.keep_new
    }
}

/// Merges `incoming` into the operation `queued` on `path`
pub fn decide(path: &RelPath, queued: &Operation, incoming: &Operation, hashes: HashState) -> Verdict {
    use Operation::*;

    match (queued, incoming) {
        // A queued rescan already covers whatever happened since
        (Resync, _) => Verdict::discard(),
        (_, Resync) => Verdict::replace(),

        // Two moves competing for the same path
        (MoveSource { destination: old }, MoveSource { destination: new }) => {
            if old == new {
                Verdict::discard()
            } else {
                Verdict {
                    cancel_queued: Some(Cancellation::ReleaseAcquired),
                    ..Verdict::discard()
                }
                .invalidating_remote_at(old)
                .invalidating_remote_at(new)
                .then(FollowUpRequest::Push(path.clone()))
                .then(FollowUpRequest::Push(old.clone()))
                .then(FollowUpRequest::Push(new.clone()))
            }
        }
        // `path -> old` then `old -> path`: the file is back where it was
        (MoveSource { destination: old }, MoveDestination { source }) if old == source => {
            Verdict {
                cancel_queued: Some(Cancellation::ReleaseAcquired),
                ..Verdict::discard()
            }
            .then(FollowUpRequest::Remove(old.clone()))
            .then(FollowUpRequest::Push(path.clone()))
        }
        // `path -> old` then `source -> path`: `old` keeps what `path` held
        // and a fresh move replaces the incoming one
        (MoveSource { destination: old }, MoveDestination { source }) => Verdict {
            cancel_queued: Some(Cancellation::ReleaseAcquired),
            ..Verdict::discard()
        }
        .then(FollowUpRequest::Push(old.clone()))
        .then(FollowUpRequest::Move {
            source: source.clone(),
            destination: path.clone(),
            inherit_locks: false,
        }),
        (MoveDestination { source: old }, MoveDestination { source: new }) => {
            if old == new {
                Verdict::discard()
            } else {
                Verdict::replace().then(FollowUpRequest::Remove(old.clone()))
            }
        }
        // `old -> path -> old`: the file is back where it was
        (MoveDestination { source: old }, MoveSource { destination: new }) if old == new => {
            Verdict {
                cancel_queued: Some(Cancellation::ReleaseAcquired),
                ..Verdict::discard()
            }
            .then(FollowUpRequest::Remove(path.clone()))
            .then(FollowUpRequest::Push(old.clone()))
        }
        // `old -> path` then `path -> new` collapses into `old -> new`
        (MoveDestination { source: old }, MoveSource { destination: new }) => Verdict {
            cancel_queued: Some(Cancellation::KeepAcquired),
            ..Verdict::discard()
        }
        .then(FollowUpRequest::Remove(path.clone()))
        .then(FollowUpRequest::Move {
            source: old.clone(),
            destination: new.clone(),
            inherit_locks: true,
        }),

        // A queued move wins over plain events, which only taint a side
        (q, n) if q.is_move() && n.is_local() => Verdict::discard().invalidating_local(),
        (q, n) if q.is_move() && n.is_remote() => Verdict::discard().invalidating_remote(),

        (LocalAdd { create }, LocalAdd { create: new_create }) => Verdict {
            upgrade_queued_to_create: *new_create && !*create,
            ..Verdict::discard()
        },
        (LocalAdd { .. }, LocalRemove) => {
            if hashes.remote_known {
                Verdict::replace()
            } else {
                Verdict::replace().invalidating_local().invalidating_remote()
            }
        }
        (LocalAdd { .. }, n) if n.is_remote() => Verdict::discard().invalidating_remote(),
        (LocalAdd { .. }, _) => Verdict::replace().invalidating_local(),

        (LocalRemove, LocalAdd { .. }) => Verdict::replace(),
        (LocalRemove, LocalRemove) => Verdict::discard(),
        (LocalRemove, RemoteAdd) => Verdict::replace().invalidating_local(),
        (LocalRemove, RemoteRemove) => Verdict::discard().invalidating_remote(),
        (LocalRemove, _) => Verdict::replace().invalidating_local(),

        (RemoteAdd, n) if n.is_local() => Verdict::discard().invalidating_local(),
        (RemoteAdd, RemoteAdd) => Verdict::discard(),
        (RemoteAdd, RemoteRemove) => {
            if hashes.local_known {
                Verdict::replace()
            } else {
                Verdict::replace().invalidating_local()
            }
        }
        (RemoteAdd, _) => Verdict::replace().invalidating_remote(),

        (RemoteRemove, LocalAdd { .. }) => Verdict::replace().invalidating_remote(),
        (RemoteRemove, LocalRemove) => Verdict::discard().invalidating_local(),
        (RemoteRemove, RemoteAdd) => Verdict::replace(),
        (RemoteRemove, RemoteRemove) => Verdict::discard(),
        (RemoteRemove, _) => Verdict::replace().invalidating_remote(),

        // Only unreachable combinations are left (a move against a move
        // kind already matched above).
        _ => Verdict::discard(),
    }
}

// ============================================================================
// Unit tests
// ============================================================================
