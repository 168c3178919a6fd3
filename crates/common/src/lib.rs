
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Canonical error type shared across the trail subsystems.
#[derive(Error, Debug)]
pub enum TrailError {
    /// The index lies outside the range the operation may touch.
    #[error("invalid index {0}")]
    InvalidIndex(u64),
    /// Append below the commit watermark, or a snapshot entry offered to the
    /// regular append path.
    #[error("invalid append: {0}")]
    InvalidAppend(String),
    /// No partition owns a committed index. The on-disk state is corrupt.
    #[error("no partition owns committed index {0}")]
    MissingPartition(u64),
    /// A single read spanning more than 2^31 entries.
    #[error("range spans more than 2^31 entries")]
    RangeTooBig,
    /// The trail has been disposed; no further operations are accepted.
    #[error("audit trail disposed")]
    Disposed,
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `TrailError`.
pub type TrailResult<T> = Result<T, TrailError>;

/// When the commit pipeline builds snapshots and detaches covered partitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionMode {
    /// Build the snapshot synchronously inside the commit critical section.
    Sequential,
    /// Build the snapshot in parallel with applying entries, both under the
    /// exclusive lock.
    Foreground,
    /// Commit never compacts; callers run `force_compaction` separately so
    /// readers and writers stay mostly unblocked.
    Background,
}

/// When cached payloads of committed entries are released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheEviction {
    /// Drop the cached payload immediately after a successful apply.
    OnCommit,
    /// Keep the payload until the owning partition next flushes.
    OnFlush,
}

/// Compression applied by the out-of-process backup tool. Carried here so a
/// single options struct configures the whole deployment; the trail itself
/// never compresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupCompression {
    None,
    Fastest,
    Optimal,
}

/// Runtime configuration for an audit trail instance.
///
/// # Example
/// ```
/// use common::{CompactionMode, Options};
///
/// let options = Options::builder()
///     .records_per_partition(128)
///     .compaction_mode(CompactionMode::Background)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Options {
    /// Entries per partition file. Must be at least 2.
    #[builder(default = 64)]
    pub records_per_partition: u64,
    /// Per-session I/O buffer size in bytes.
    #[builder(default = 4096)]
    pub buffer_size: usize,
    /// Snapshot I/O buffer size in bytes, used by compaction.
    #[builder(default = 32768)]
    pub snapshot_buffer_size: usize,
    /// Pre-allocation hint for new partition files, in bytes. Zero disables
    /// pre-allocation.
    #[builder(default = 0)]
    pub initial_partition_size: u64,
    /// Number of reader sessions in the pool.
    #[builder(default = 8)]
    pub max_concurrent_reads: usize,
    /// Sync partition and snapshot writes immediately instead of at flush
    /// boundaries; flush becomes a metadata-only barrier.
    #[builder(default = false)]
    pub write_through: bool,
    #[builder(default = CompactionMode::Sequential)]
    pub compaction_mode: CompactionMode,
    #[builder(default = CacheEviction::OnCommit)]
    pub cache_eviction: CacheEviction,
    /// Reapply the snapshot and committed entries to the state machine when
    /// the trail is opened.
    #[builder(default = false)]
    pub replay_on_initialize: bool,
    #[builder(default = BackupCompression::None)]
    pub backup_compression: BackupCompression,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            records_per_partition: 64,
            buffer_size: 4096,
            snapshot_buffer_size: 32768,
            initial_partition_size: 0,
            max_concurrent_reads: 8,
            write_through: false,
            compaction_mode: CompactionMode::Sequential,
            cache_eviction: CacheEviction::OnCommit,
            replay_on_initialize: false,
            backup_compression: BackupCompression::None,
        }
    }
}

impl Options {
    /// Check the invariants the storage engine relies on.
    pub fn validate(&self) -> TrailResult<()> {
        if self.records_per_partition < 2 {
            return Err(TrailError::Config(
                "records_per_partition must be at least 2".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(TrailError::Config("buffer_size must be non-zero".into()));
        }
        if self.max_concurrent_reads == 0 {
            return Err(TrailError::Config(
                "max_concurrent_reads must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        BackupCompression, CacheEviction, CompactionMode, Options, TrailError, TrailResult,
    };
}
