//! End-to-end scenarios over a real directory: append/commit/read flows,
//! compaction in every mode, snapshot install, tail rewrites, concurrent
//! readers, and crash recovery.

use bytes::Bytes;
use common::{CacheEviction, CompactionMode, Options, TrailError};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use testsupport::prelude::*;
use trail::{AuditTrail, LogEntry};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_partitions() -> Options {
    Options::builder().records_per_partition(4).build()
}

#[tokio::test]
async fn basic_append_commit_read() {
    init_logging();
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c"), (2, "d"), (2, "e")]);
    let last = ctx.trail.append(batch, 1, false).await.unwrap();
    assert_eq!(last, 5);

    let committed = ctx.trail.commit(Some(3)).await.unwrap();
    assert_eq!(committed, 3);

    assert_eq!(ctx.trail.last_index(), 5);
    assert_eq!(ctx.trail.commit_index(), 3);
    assert_eq!(ctx.trail.last_applied(), 3);
    assert_eq!(ctx.machine.applied_payloads(), vec!["a", "b", "c"]);

    let read = ctx.trail.read(1, 5).await.unwrap();
    assert_eq!(read.len(), 5);
    let payloads: Vec<_> = read.iter().map(|e| e.payload.clone()).collect();
    assert_eq!(payloads, vec!["a", "b", "c", "d", "e"]);

    // Indices 1..=5 span partitions 0 (0..=3) and 1 (4..=7).
    assert!(ctx.dir().join("0").exists());
    assert!(ctx.dir().join("1").exists());
}

#[tokio::test]
async fn sequential_commit_builds_snapshot() {
    init_logging();
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c"), (2, "d"), (2, "e")]);
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(Some(3)).await.unwrap();

    let more = entries(&[(2, "f"), (2, "g"), (2, "h"), (2, "i")]);
    ctx.trail.append(more, 6, false).await.unwrap();
    ctx.trail.commit(Some(8)).await.unwrap();

    // commit_index - snapshot_index = 8 >= 4, so the commit compacted.
    assert_eq!(ctx.trail.snapshot_index(), 8);
    assert!(!ctx.dir().join("0").exists());
    assert!(!ctx.dir().join("1").exists());
    assert!(ctx.dir().join("2").exists());

    let read = ctx.trail.read(1, 5).await.unwrap();
    assert_eq!(read.len(), 1);
    assert!(read[0].is_snapshot);
    assert_eq!(read[0].payload, Bytes::from("abcdefgh"));

    let tail = ctx.trail.read(9, 9).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].payload, Bytes::from("i"));
}

#[tokio::test]
async fn snapshot_install_overrides_tail() {
    init_logging();
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch: Vec<LogEntry> = (1..=10).map(|i| entry(1, &format!("e{i}"))).collect();
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(Some(5)).await.unwrap();
    assert_eq!(ctx.trail.last_index(), 10);
    assert_eq!(ctx.trail.commit_index(), 5);

    ctx.trail
        .install_snapshot(LogEntry::snapshot(3, "S"), 12)
        .await
        .unwrap();

    assert_eq!(ctx.trail.snapshot_index(), 12);
    assert_eq!(ctx.trail.commit_index(), 12);
    assert_eq!(ctx.trail.last_index(), 12);
    assert_eq!(ctx.trail.last_applied(), 12);
    assert_eq!(ctx.machine.state(), "S");

    // Every partition was at or below index 12.
    assert!(!ctx.dir().join("0").exists());
    assert!(!ctx.dir().join("1").exists());
    assert!(!ctx.dir().join("2").exists());

    let read = ctx.trail.read(6, 12).await.unwrap();
    assert_eq!(read.len(), 1);
    assert!(read[0].is_snapshot);

    let last = ctx.trail.append(vec![entry(4, "x")], 13, false).await.unwrap();
    assert_eq!(last, 13);
}

#[tokio::test]
async fn tail_rewrite_shrinks_log() {
    init_logging();
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c"), (2, "d"), (2, "e"), (2, "f")]);
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(Some(2)).await.unwrap();

    let rewrite = entries(&[(3, "D"), (3, "E")]);
    let last = ctx.trail.append(rewrite, 4, false).await.unwrap();
    assert_eq!(last, 5);
    assert_eq!(ctx.trail.last_index(), 5);

    let read = ctx.trail.read(4, 5).await.unwrap();
    let payloads: Vec<_> = read.iter().map(|e| e.payload.clone()).collect();
    assert_eq!(payloads, vec!["D", "E"]);
    assert_eq!(read[0].term, 3);

    assert!(ctx.trail.read(6, 6).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_reader_never_sees_torn_entries() {
    init_logging();
    let machine = RecordingMachine::new();
    let dir = tempfile::tempdir().unwrap();
    let trail = Arc::new(
        AuditTrail::open(dir.path(), small_partitions(), machine)
            .await
            .unwrap(),
    );

    let seed: Vec<LogEntry> = (1..=100).map(|i| entry(1, &format!("p{i}"))).collect();
    trail.append(seed, 1, false).await.unwrap();

    let appender = {
        let trail = trail.clone();
        tokio::spawn(async move {
            for i in 101..=200u64 {
                trail.append_entry(entry(1, &format!("p{i}")), false).await.unwrap();
            }
        })
    };

    let reader = {
        let trail = trail.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                let read = trail.read(1, 100).await.unwrap();
                assert_eq!(read.len(), 100);
                for (offset, entry) in read.iter().enumerate() {
                    let expected = format!("p{}", offset + 1);
                    assert_eq!(entry.payload, Bytes::from(expected));
                }
                tokio::task::yield_now().await;
            }
        })
    };

    appender.await.unwrap();
    reader.await.unwrap();
    assert_eq!(trail.last_index(), 200);
}

#[tokio::test]
async fn interrupted_snapshot_install_is_discarded_on_restart() {
    init_logging();
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c"), (1, "d"), (1, "e")]);
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(None).await.unwrap();
    assert_eq!(ctx.trail.snapshot_index(), 5);

    // Crash between writing snapshot.new and the rename.
    std::fs::write(ctx.dir().join("snapshot.new"), b"partial snapshot bytes").unwrap();

    let options = Options::builder()
        .records_per_partition(4)
        .replay_on_initialize(true)
        .build();
    let ctx = ctx.restart(options).await.unwrap();

    assert_eq!(ctx.trail.snapshot_index(), 5);
    assert!(!ctx.dir().join("snapshot.new").exists());

    // No state machine regression: replay reaches the committed state.
    assert_eq!(ctx.machine.state(), "abcde");
}

#[tokio::test]
async fn restart_replays_committed_entries() {
    init_logging();
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c")]);
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(Some(2)).await.unwrap();
    assert_eq!(ctx.machine.applied_payloads(), vec!["a", "b"]);

    let options = Options::builder()
        .records_per_partition(4)
        .replay_on_initialize(true)
        .build();
    let ctx = ctx.restart(options).await.unwrap();

    // Only the committed prefix is reapplied.
    assert_eq!(ctx.machine.applied_payloads(), vec!["a", "b"]);
    assert_eq!(ctx.trail.last_index(), 3);
    assert_eq!(ctx.trail.commit_index(), 2);
    assert_eq!(ctx.trail.last_applied(), 2);

    // The uncommitted tail survived the restart.
    let read = ctx.trail.read(3, 3).await.unwrap();
    assert_eq!(read[0].payload, Bytes::from("c"));
}

#[tokio::test]
async fn background_compaction_keeps_one_partition_margin() {
    init_logging();
    let options = Options::builder()
        .records_per_partition(4)
        .compaction_mode(CompactionMode::Background)
        .build();
    let ctx = TrailContext::new(options).await.unwrap();

    let batch: Vec<LogEntry> = "abcdefghijkl"
        .chars()
        .map(|c| entry(1, &c.to_string()))
        .collect();
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(None).await.unwrap();

    // Commit never compacts in background mode.
    assert_eq!(ctx.trail.snapshot_index(), 0);
    assert_eq!(ctx.trail.compaction_count(), 2);

    let freed = ctx.trail.force_compaction(10).await.unwrap();
    assert_eq!(freed, 2);
    assert_eq!(ctx.trail.snapshot_index(), 7);
    assert!(!ctx.dir().join("0").exists());
    assert!(!ctx.dir().join("1").exists());
    assert!(ctx.dir().join("2").exists());

    let read = ctx.trail.read(1, 7).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].payload, Bytes::from("abcdefg"));
}

#[tokio::test]
async fn foreground_commit_compacts_applied_prefix() {
    init_logging();
    let options = Options::builder()
        .records_per_partition(4)
        .compaction_mode(CompactionMode::Foreground)
        .build();
    let ctx = TrailContext::new(options).await.unwrap();

    let batch: Vec<LogEntry> = (1..=6).map(|i| entry(1, &format!("f{i}"))).collect();
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(None).await.unwrap();
    // Nothing was applied before this commit, so nothing to compact yet.
    assert_eq!(ctx.trail.snapshot_index(), 0);

    let more: Vec<LogEntry> = (7..=10).map(|i| entry(1, &format!("f{i}"))).collect();
    ctx.trail.append(more, 7, false).await.unwrap();
    ctx.trail.commit(None).await.unwrap();

    // The build ran over the prefix applied by the first commit.
    assert_eq!(ctx.trail.snapshot_index(), 6);
    assert!(!ctx.dir().join("0").exists());
    assert!(ctx.dir().join("1").exists());
    assert_eq!(ctx.trail.last_applied(), 10);

    let read = ctx.trail.read(1, 6).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].payload, Bytes::from("f1f2f3f4f5f6"));
}

#[tokio::test]
async fn snapshot_builder_cursor_skips_ranges() {
    init_logging();
    let machine = RecordingMachine::with_skip(2, 3);
    let dir = tempfile::tempdir().unwrap();
    let trail = AuditTrail::open(dir.path(), small_partitions(), machine)
        .await
        .unwrap();

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c"), (1, "d"), (1, "e")]);
    trail.append(batch, 1, false).await.unwrap();
    trail.commit(None).await.unwrap();

    // Compaction folded 1, skipped 2..=3 per the builder's advice, then 4, 5.
    assert_eq!(trail.snapshot_index(), 5);
    let read = trail.read(1, 5).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].payload, Bytes::from("ade"));
}

#[tokio::test]
async fn partition_boundary_reads_are_contiguous() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch: Vec<LogEntry> = (1..=8).map(|i| entry(1, &format!("x{i}"))).collect();
    ctx.trail.append(batch, 1, false).await.unwrap();

    // Indices 3 and 4 straddle partitions 0 and 1.
    let read = ctx.trail.read(3, 4).await.unwrap();
    let payloads: Vec<_> = read.iter().map(|e| e.payload.clone()).collect();
    assert_eq!(payloads, vec!["x3", "x4"]);
    assert!(ctx.dir().join("0").exists());
    assert!(ctx.dir().join("1").exists());
}

#[tokio::test]
async fn empty_log_reads() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let read = ctx.trail.read(0, 0).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].term, 0);
    assert!(read[0].is_empty());

    assert!(ctx.trail.read(3, 7).await.unwrap().is_empty());
}

#[tokio::test]
async fn drop_tail_boundaries() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c"), (1, "d"), (1, "e")]);
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(Some(2)).await.unwrap();

    // Dropping at or below the commit index is rejected.
    let err = ctx.trail.drop_tail(2).await.unwrap_err();
    assert!(matches!(err, TrailError::InvalidAppend(_)));

    let dropped = ctx.trail.drop_tail(3).await.unwrap();
    assert_eq!(dropped, 3);
    assert_eq!(ctx.trail.last_index(), 2);
    assert!(ctx.trail.read(3, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn append_below_commit_is_rejected_unless_skipping() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c")]);
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(Some(2)).await.unwrap();

    let err = ctx
        .trail
        .append(entries(&[(1, "A")]), 2, false)
        .await
        .unwrap_err();
    assert!(matches!(err, TrailError::InvalidAppend(_)));

    // The replication path skips the committed prefix instead.
    let last = ctx
        .trail
        .append(entries(&[(1, "b"), (1, "C"), (1, "d")]), 2, true)
        .await
        .unwrap();
    assert_eq!(last, 4);
    let read = ctx.trail.read(3, 4).await.unwrap();
    let payloads: Vec<_> = read.iter().map(|e| e.payload.clone()).collect();
    assert_eq!(payloads, vec!["C", "d"]);
}

#[tokio::test]
async fn snapshot_entry_rejected_by_regular_append() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();
    let err = ctx
        .trail
        .append(vec![LogEntry::snapshot(1, "s")], 1, false)
        .await
        .unwrap_err();
    assert!(matches!(err, TrailError::InvalidAppend(_)));
}

#[tokio::test]
async fn snapshot_install_is_idempotent() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    ctx.trail
        .install_snapshot(LogEntry::snapshot(2, "S"), 6)
        .await
        .unwrap();
    ctx.trail
        .install_snapshot(LogEntry::snapshot(2, "S"), 6)
        .await
        .unwrap();

    assert_eq!(ctx.trail.snapshot_index(), 6);
    assert_eq!(ctx.trail.commit_index(), 6);
    assert_eq!(ctx.trail.last_index(), 6);
    assert_eq!(ctx.machine.state(), "S");
}

#[tokio::test]
async fn commit_wait_is_satisfied_for_all_lower_targets() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    assert!(!ctx.trail.wait_for_commit(1, Duration::from_millis(20)).await);

    let batch = entries(&[(1, "a"), (1, "b"), (1, "c")]);
    ctx.trail.append(batch, 1, false).await.unwrap();
    ctx.trail.commit(Some(3)).await.unwrap();

    for target in 1..=3 {
        assert!(ctx.trail.wait_for_commit(target, Duration::from_millis(20)).await);
    }
}

#[tokio::test]
async fn commit_waiter_wakes_on_commit() {
    let machine = RecordingMachine::new();
    let dir = tempfile::tempdir().unwrap();
    let trail = Arc::new(
        AuditTrail::open(dir.path(), small_partitions(), machine)
            .await
            .unwrap(),
    );

    let waiter = {
        let trail = trail.clone();
        tokio::spawn(async move { trail.wait_for_commit(2, Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;

    trail.append(entries(&[(1, "a"), (1, "b")]), 1, false).await.unwrap();
    trail.commit(None).await.unwrap();
    assert!(waiter.await.unwrap());
}

#[tokio::test]
async fn consistency_wait_tracks_applied_term() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();

    ctx.trail.update_term(2, true).await.unwrap();
    assert!(!ctx.trail.ensure_consistency(Duration::from_millis(20)).await);

    ctx.trail.append(entries(&[(2, "a")]), 1, false).await.unwrap();
    ctx.trail.commit(None).await.unwrap();
    assert!(ctx.trail.ensure_consistency(Duration::from_millis(20)).await);
}

#[tokio::test]
async fn cached_append_survives_commit_and_restart() {
    let options = Options::builder()
        .records_per_partition(4)
        .cache_eviction(CacheEviction::OnCommit)
        .build();
    let ctx = TrailContext::new(options).await.unwrap();

    let index = ctx.trail.append_entry(entry(1, "cached"), true).await.unwrap();
    assert_eq!(index, 1);

    // Visible before any flush, served from the cache.
    let read = ctx.trail.read(1, 1).await.unwrap();
    assert_eq!(read[0].payload, Bytes::from("cached"));

    ctx.trail.commit(None).await.unwrap();
    assert_eq!(ctx.machine.applied_payloads(), vec!["cached"]);

    // The commit persisted the cached payload before evicting it.
    let ctx = ctx.restart(small_partitions()).await.unwrap();
    let read = ctx.trail.read(1, 1).await.unwrap();
    assert_eq!(read[0].payload, Bytes::from("cached"));
}

#[tokio::test]
async fn term_and_vote_are_durable() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();
    let candidate = uuid::Uuid::from_u128(7);

    ctx.trail.update_term(3, true).await.unwrap();
    ctx.trail.update_vote(candidate).await.unwrap();
    assert_eq!(ctx.trail.increment_term().await.unwrap(), 4);
    assert_eq!(ctx.trail.voted_for(), None);
    ctx.trail.update_vote(candidate).await.unwrap();

    let ctx = ctx.restart(small_partitions()).await.unwrap();
    assert_eq!(ctx.trail.term(), 4);
    assert_eq!(ctx.trail.voted_for(), Some(candidate));

    let err = ctx.trail.update_term(1, false).await.unwrap_err();
    assert!(matches!(err, TrailError::InvalidAppend(_)));
}

#[tokio::test]
async fn disposed_trail_rejects_operations() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();
    ctx.trail.dispose().await.unwrap();

    let err = ctx.trail.read(0, 0).await.unwrap_err();
    assert!(matches!(err, TrailError::Disposed));
    let err = ctx.trail.append(entries(&[(1, "a")]), 1, false).await.unwrap_err();
    assert!(matches!(err, TrailError::Disposed));
}

#[tokio::test]
async fn oversized_range_is_rejected() {
    let ctx = TrailContext::new(small_partitions()).await.unwrap();
    let err = ctx.trail.read(0, u64::MAX / 2).await.unwrap_err();
    assert!(matches!(err, TrailError::RangeTooBig));
}
