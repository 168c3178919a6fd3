//! Collaborator seams: the applied state machine and the snapshot builder.

use crate::entry::LogEntry;
use async_trait::async_trait;
use common::TrailResult;

/// The external state machine fed committed entries.
///
/// `apply` is invoked once per newly-committed index in increasing order.
/// Across restarts with replay enabled the guarantee weakens to
/// at-least-once from a clean state, so implementations must be idempotent
/// with respect to full re-application. A snapshot entry passed to `apply`
/// (during install or replay) replaces the machine's state wholesale.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, index: u64, entry: &LogEntry) -> TrailResult<()>;

    /// Start a builder that folds committed entries into the next snapshot.
    fn snapshot_builder(&self) -> Box<dyn SnapshotBuilder>;
}

/// Folds a range of entries into a snapshot payload.
///
/// The build loop seeds the builder with the current snapshot entry (if
/// any), then folds each committed entry up to the compaction target. Before
/// each fold the cursor is offered to `adjust_index`, so builders that can
/// prove a range irrelevant may skip ahead. Dropping the builder releases
/// whatever it holds.
#[async_trait]
pub trait SnapshotBuilder: Send {
    /// Fold one entry into the accumulated state.
    async fn apply(&mut self, index: u64, entry: &LogEntry) -> TrailResult<()>;

    /// Advise the fold cursor. The returned index is clamped to
    /// `[start, end + 1]`; returning `cursor` unchanged folds every entry.
    fn adjust_index(&self, _start: u64, _end: u64, cursor: u64) -> u64 {
        cursor
    }

    /// Serialize the accumulated state into the snapshot entry.
    async fn build(&mut self, term: u64) -> TrailResult<LogEntry>;
}
