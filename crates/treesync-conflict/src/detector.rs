//! Divergence detection
//!
//! Determines which side of a file changed since the last reconciliation
//! by comparing the current hashes against the last known pair.

use tracing::debug;
use treesync_core::domain::newtypes::HashPair;

/// Outcome of a three-way hash comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Neither side moved away from the last known pair
    InSync,
    /// Only the local content changed: push it
    LocalChanged,
    /// Only the remote content changed: pull it
    RemoteChanged,
    /// Both sides changed: compare contents, maybe a conflict
    BothChanged,
}

impl Divergence {
    /// Classifies the current state of a file
    ///
    /// A side counts as changed when its current hash differs from the
    /// last known one. An absent current hash means the file is missing on
    /// that side; an absent known hash means that side was never seen or
    /// was invalidated.
    ///
    /// # Arguments
    /// * `current_local` - Hash of the local content right now
    /// * `known` - Hash pair recorded at the last reconciliation
    /// * `current_remote` - Remote metadata hash right now
    pub fn classify(
        current_local: Option<&str>,
        known: &HashPair,
        current_remote: Option<&str>,
    ) -> Self {
        let local = Self::side_changed(current_local, known.local.as_deref());
        let remote = Self::side_changed(current_remote, known.remote.as_deref());

        let divergence = match (local, remote) {
            (false, false) => Divergence::InSync,
            (true, false) => Divergence::LocalChanged,
            (false, true) => Divergence::RemoteChanged,
            (true, true) => Divergence::BothChanged,
        };
        debug!(
            ?current_local,
            ?current_remote,
            known = %known,
            ?divergence,
            "classified hashes"
        );
        divergence
    }

    /// Whether one side moved away from its last known hash
    pub fn side_changed(current: Option<&str>, known: Option<&str>) -> bool {
        current != known
    }

    /// Returns true when a content comparison is needed
    pub fn needs_content_check(&self) -> bool {
        matches!(self, Divergence::BothChanged)
    }
}
