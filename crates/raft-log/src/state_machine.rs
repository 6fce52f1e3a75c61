//! Embedder hooks: the user-defined application state machine and its
//! snapshot builder.
//!
//! These are plain generic traits rather than a specific external
//! consensus crate's storage trait. The log owns its coordinator and calls
//! out to the embedder, instead of the embedder's trait owning the log.

use crate::entry::Entry;

/// The application logic that consumes committed entries.
pub trait StateMachine: Send + Sync {
    /// A builder that folds entries into a compacted snapshot.
    type Builder: SnapshotBuilder;

    /// Applies one committed entry, including the snapshot entry produced
    /// during install or compaction.
    fn apply(&self, entry: &Entry);

    /// Returns a fresh builder for a compaction pass, or `None` if this
    /// state machine does not support snapshotting (compaction is then
    /// never triggered).
    fn create_snapshot_builder(&self) -> Option<Self::Builder>;
}

/// Accumulates committed entries into a single compacted payload.
pub trait SnapshotBuilder: Send {
    /// Folds one committed entry's effect into the builder's running
    /// state.
    fn apply_core(&mut self, entry: &Entry);

    /// Consumes the builder, producing the snapshot entry that replaces
    /// every entry up to and including `snapshot_index`.
    fn into_entry(self, snapshot_index: u64, term: i64, timestamp: i64) -> Entry;
}
