//! Persistent, append-only audit trail used as the replicated log of a Raft
//! consensus node.
//!
//! Clients append entries, wait for them to be committed, read index
//! ranges, install snapshots sent by a leader, and compact committed
//! history into a snapshot to bound disk usage. Payload bytes are opaque;
//! the trail stores an ordered sequence keyed by monotonically increasing
//! 64-bit indices. One process owns the directory for its lifetime.
//!
//! ## File layout
//!
//! ```text
//! {dir}/
//! ├── node.state     # term, vote, commit/apply/last watermarks (48 B)
//! ├── snapshot       # single snapshot entry + index footer
//! ├── snapshot.new   # transient, present only during install
//! └── {N}            # partition N, entries for [N*R, N*R + R - 1]
//! ```
//!
//! ## Concurrency
//!
//! A four-mode lock ([`lock::LockManager`]) coordinates everything:
//! appenders hold Write, readers hold WeakRead (never blocking writers),
//! compaction holds Compaction, and commit / snapshot install / tail
//! rewrites hold Exclusive. Reader sessions come from a fixed pool so
//! concurrent reads never share buffers. Dropping an operation future at an
//! await point cancels it without side effects; the timed waits take
//! explicit timeouts.

pub mod entry;
mod fileio;
pub mod lock;
pub mod machine;
pub mod partition;
pub mod session;
pub mod signal;
pub mod snapshot;
pub mod state;

pub use common::{BackupCompression, CacheEviction, CompactionMode, Options, TrailError, TrailResult};
pub use entry::{EntryMeta, LogEntry, METADATA_SIZE};
pub use machine::{SnapshotBuilder, StateMachine};
pub use signal::Watermarks;
pub use state::NodeState;

use crate::lock::{LockManager, LockMode};
use crate::partition::{Partition, PartitionList};
use crate::session::{Session, SessionPool};
use crate::signal::CommitSignal;
use crate::snapshot::SnapshotStore;
use crate::state::StateFile;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// The audit trail: a partitioned on-disk log, a snapshot object, the node
/// state record, and the commit pipeline that feeds the state machine.
pub struct AuditTrail {
    dir: PathBuf,
    options: Options,
    machine: Arc<dyn StateMachine>,
    lock: LockManager,
    sessions: SessionPool,
    partitions: RwLock<PartitionList>,
    state: Mutex<NodeState>,
    state_file: StateFile,
    snapshot: SnapshotStore,
    signal: CommitSignal,
    /// Term of the last log entry, for election bookkeeping.
    last_entry_term: AtomicU64,
    /// Term of the most recently applied entry, for consistency waits.
    applied_term: AtomicU64,
    disposed: AtomicBool,
}

impl AuditTrail {
    /// Open or create a trail in `dir`.
    ///
    /// Recovery reads `node.state`, rebuilds the partition list from the
    /// decimal-named files, loads the snapshot footer, and discards any
    /// `snapshot.new` left by an interrupted install. With
    /// `replay_on_initialize` the snapshot and committed entries are
    /// reapplied to the state machine before the call returns.
    pub async fn open(
        dir: impl AsRef<Path>,
        options: Options,
        machine: Arc<dyn StateMachine>,
    ) -> TrailResult<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let (state_file, state) = StateFile::open(&dir)?;
        let snapshot = SnapshotStore::open(&dir, options.snapshot_buffer_size)?;

        let mut partitions = PartitionList::new(options.records_per_partition);
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            if let Some(number) = name.to_str().and_then(|n| n.parse::<u64>().ok()) {
                partitions.insert(Arc::new(Partition::open(&dir, number, &options)?));
            }
        }

        log::info!(
            target: "trail",
            "opened audit trail at {}: last={} commit={} applied={} snapshot={}",
            dir.display(),
            state.last_index,
            state.commit_index,
            state.last_applied,
            snapshot.index(),
        );

        let trail = Self {
            sessions: SessionPool::new(
                options.max_concurrent_reads,
                options.buffer_size,
                options.snapshot_buffer_size,
            ),
            signal: CommitSignal::new(Watermarks {
                commit_index: state.commit_index,
                term: state.term,
                applied_term: 0,
            }),
            lock: LockManager::new(),
            partitions: RwLock::new(partitions),
            state: Mutex::new(state),
            state_file,
            snapshot,
            machine,
            last_entry_term: AtomicU64::new(0),
            applied_term: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            options,
            dir,
        };

        trail.recover_terms(&state)?;
        if trail.options.replay_on_initialize {
            trail.replay().await?;
        }
        Ok(trail)
    }

    /// First index not covered by the snapshot, or zero when the log has no
    /// snapshot.
    pub fn first_index(&self) -> u64 {
        let snapshot = self.snapshot.index();
        if snapshot > 0 {
            snapshot + 1
        } else {
            0
        }
    }

    pub fn last_index(&self) -> u64 {
        self.state.lock().unwrap().last_index
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().unwrap().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.state.lock().unwrap().last_applied
    }

    pub fn term(&self) -> u64 {
        self.state.lock().unwrap().term
    }

    pub fn voted_for(&self) -> Option<Uuid> {
        self.state.lock().unwrap().last_vote
    }

    /// Term of the entry at `last_index`.
    pub fn last_term(&self) -> u64 {
        self.last_entry_term.load(Ordering::Relaxed)
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.index()
    }

    /// Partitions that background compaction may currently fold without
    /// blocking writers: everything applied, minus one whole partition kept
    /// between the snapshot and the tail.
    pub fn compaction_count(&self) -> u64 {
        let snapshot = self.snapshot.index();
        let applied = self.last_applied();
        (applied.saturating_sub(snapshot) / self.options.records_per_partition).saturating_sub(1)
    }

    /// Persist a new term. `reset_vote` clears the vote, as a term change
    /// demands.
    pub async fn update_term(&self, term: u64, reset_vote: bool) -> TrailResult<()> {
        self.ensure_live()?;
        let _guard = self.lock.acquire(LockMode::Write).await;
        {
            let mut state = self.state.lock().unwrap();
            if term < state.term {
                return Err(TrailError::InvalidAppend("term may not decrease".into()));
            }
            state.term = term;
            if reset_vote {
                state.last_vote = None;
            }
        }
        self.persist_state()?;
        self.publish();
        Ok(())
    }

    /// Advance the term by one, clearing the vote. Returns the new term.
    pub async fn increment_term(&self) -> TrailResult<u64> {
        self.ensure_live()?;
        let _guard = self.lock.acquire(LockMode::Write).await;
        let term = {
            let mut state = self.state.lock().unwrap();
            state.term += 1;
            state.last_vote = None;
            state.term
        };
        self.persist_state()?;
        self.publish();
        Ok(term)
    }

    /// Record a vote for `candidate` in the current term.
    pub async fn update_vote(&self, candidate: Uuid) -> TrailResult<()> {
        self.ensure_live()?;
        let _guard = self.lock.acquire(LockMode::Write).await;
        self.state.lock().unwrap().last_vote = Some(candidate);
        self.persist_state()
    }

    /// Append `entries` starting at `start_index`.
    ///
    /// An append at the tail takes the Write lock; a tail rewrite (any
    /// `start_index` below the tail) escalates to Exclusive. With
    /// `skip_committed` the already-committed prefix is skipped, which is
    /// what the replication path needs; without it an append at or below
    /// the commit index is rejected. When a rewrite is shorter than the old
    /// tail the orphaned slots are zeroed and `last_index` moves down.
    ///
    /// Returns the new last index.
    pub async fn append(
        &self,
        entries: Vec<LogEntry>,
        start_index: u64,
        skip_committed: bool,
    ) -> TrailResult<u64> {
        self.ensure_live()?;
        if start_index == 0 {
            return Err(TrailError::InvalidIndex(0));
        }
        if entries.iter().any(|e| e.is_snapshot) {
            return Err(TrailError::InvalidAppend(
                "snapshot entry in regular append".into(),
            ));
        }
        if entries.is_empty() {
            return Ok(self.last_index());
        }

        let mut guard = self.lock.acquire(LockMode::Write).await;
        let (first, skipped) = loop {
            let (commit, tail) = {
                let state = self.state.lock().unwrap();
                (state.commit_index, state.tail_index())
            };
            let skipped = if skip_committed && start_index <= commit {
                (((commit + 1) - start_index) as usize).min(entries.len())
            } else {
                0
            };
            if skipped == entries.len() {
                return Ok(self.last_index());
            }
            let first = start_index + skipped as u64;
            if first <= commit {
                return Err(TrailError::InvalidAppend(
                    "append below commit index".into(),
                ));
            }
            if first > tail {
                return Err(TrailError::InvalidIndex(first));
            }
            if first == tail || guard.mode() == LockMode::Exclusive {
                break (first, skipped);
            }
            // Tail rewrite: escalate and re-validate, the watermarks may
            // have moved while the Write lock was dropped.
            drop(guard);
            guard = self.lock.acquire(LockMode::Exclusive).await;
        };

        let old_last = self.last_index();
        let mut writer = self.sessions.writer().await;
        let mut index = first;
        let mut touched: Vec<Arc<Partition>> = Vec::new();
        let mut failure = None;

        for entry in &entries[skipped..] {
            let partition = {
                let mut partitions = self.partitions.write().unwrap();
                partitions.get_or_create(index, &self.dir, &self.options)?
            };
            if let Err(e) = partition.write(&mut writer, entry, index) {
                failure = Some(e);
                break;
            }
            if touched.last().map(|p| p.number()) != Some(partition.number()) {
                touched.push(partition.clone());
            }
            if index == partition.last_index() {
                if let Err(e) = partition.flush(&mut writer) {
                    failure = Some(e);
                    break;
                }
            }
            index += 1;
        }

        for partition in &touched {
            if let Err(e) = partition.flush(&mut writer) {
                failure.get_or_insert(e);
            }
        }
        drop(writer);

        let written_last = index.checked_sub(1).filter(|last| *last >= first);
        let new_last = if failure.is_none() {
            // A rewrite shorter than the old tail moves `last_index` down.
            written_last.unwrap_or(old_last)
        } else if first == old_last + 1 {
            // Tail append: the caller observes how far the write got.
            written_last.unwrap_or(old_last)
        } else {
            // Failed rewrite: the old suffix beyond the written prefix is
            // still present, so the tail does not move.
            old_last
        };

        let mut detached = Vec::new();
        if failure.is_none() && new_last < old_last {
            detached = self.partitions.write().unwrap().detach_above(new_last);
            for orphan in new_last + 1..=old_last {
                if let Some(partition) = self.partitions.read().unwrap().find(orphan) {
                    partition.clear_slot(orphan)?;
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.last_index = new_last;
        }
        if let Some(last_entry) = entries.last() {
            if failure.is_none() {
                self.last_entry_term.store(last_entry.term, Ordering::Relaxed);
            }
        }
        self.persist_state()?;
        log::trace!(
            target: "trail",
            "appended {} entries at {first}, last index now {new_last}",
            entries.len() - skipped,
        );

        drop(guard);
        for partition in detached {
            if let Err(e) = partition.delete() {
                log::warn!(target: "trail", "failed to delete partition file: {e}");
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(new_last),
        }
    }

    /// Append one entry at the tail. With `cache` the payload stays in
    /// memory and the disk write is deferred to the next flush boundary,
    /// which lowers commit latency for a leader that commits what it just
    /// appended.
    pub async fn append_entry(&self, entry: LogEntry, cache: bool) -> TrailResult<u64> {
        self.ensure_live()?;
        if entry.is_snapshot {
            return Err(TrailError::InvalidAppend(
                "snapshot entry in regular append".into(),
            ));
        }

        let _guard = self.lock.acquire(LockMode::Write).await;
        let index = self.state.lock().unwrap().tail_index();
        let partition = {
            let mut partitions = self.partitions.write().unwrap();
            partitions.get_or_create(index, &self.dir, &self.options)?
        };

        if cache {
            partition.write_cached(&entry, index)?;
            if index == partition.last_index() {
                let mut writer = self.sessions.writer().await;
                partition.flush(&mut writer)?;
            }
        } else {
            let mut writer = self.sessions.writer().await;
            partition.write(&mut writer, &entry, index)?;
            partition.flush(&mut writer)?;
        }

        self.state.lock().unwrap().last_index = index;
        self.last_entry_term.store(entry.term, Ordering::Relaxed);
        self.persist_state()?;
        Ok(index)
    }

    /// Read entries in `[start, end]`, clamped to the last index.
    ///
    /// Any prefix at or below the snapshot index is represented by the
    /// snapshot entry alone. Index 0 of a snapshot-free log is the
    /// ephemeral initial entry with term 0. An empty result means the range
    /// lies wholly beyond the log.
    pub async fn read(&self, start: u64, end: u64) -> TrailResult<Vec<LogEntry>> {
        self.ensure_live()?;
        if end < start {
            return Err(TrailError::InvalidIndex(end));
        }
        if end - start >= (1u64 << 31) {
            return Err(TrailError::RangeTooBig);
        }

        let _guard = self.lock.acquire(LockMode::WeakRead).await;
        let mut session = self.sessions.open();
        let result = self.read_locked(&mut session, start, end);
        self.sessions.close(session);
        result
    }

    fn read_locked(
        &self,
        session: &mut Session,
        mut start: u64,
        end: u64,
    ) -> TrailResult<Vec<LogEntry>> {
        let end = end.min(self.last_index());
        let mut out = Vec::new();

        let snapshot = self.snapshot.index();
        if snapshot > 0 && start <= snapshot {
            out.push(self.snapshot.read(session)?);
            start = snapshot + 1;
        } else if start == 0 {
            out.push(LogEntry::initial());
            start = 1;
        }

        // Sequential reads mostly stay inside one partition; keep a cursor
        // instead of hitting the map per index.
        let mut cursor: Option<Arc<Partition>> = None;
        let mut index = start;
        while index <= end {
            let partition = match &cursor {
                Some(p) if p.first_index() <= index && index <= p.last_index() => p.clone(),
                _ => match self.partitions.read().unwrap().find(index) {
                    Some(p) => {
                        cursor = Some(p.clone());
                        p
                    }
                    None => break,
                },
            };
            match partition.read(session, index)? {
                Some(entry) => out.push(entry),
                None => break,
            }
            index += 1;
        }
        Ok(out)
    }

    /// Advance the commit index to `min(end, last_index)` (or the whole
    /// tail without `end`), apply the newly committed entries to the state
    /// machine in order, and compact per the configured mode. Returns the
    /// number of entries committed.
    pub async fn commit(&self, end: Option<u64>) -> TrailResult<u64> {
        self.ensure_live()?;
        let guard = self.lock.acquire(LockMode::Exclusive).await;

        let (target, count, prev_applied) = {
            let mut state = self.state.lock().unwrap();
            let target = end.unwrap_or(state.last_index).min(state.last_index);
            if target <= state.commit_index {
                return Ok(0);
            }
            let count = target - state.commit_index;
            state.commit_index = target;
            (target, count, state.last_applied)
        };
        self.persist_state()?;

        let (applied, detached) = match self.options.compaction_mode {
            CompactionMode::Sequential => {
                let applied = self.apply_range(prev_applied, target).await;
                let detached = if applied.is_ok() && self.compaction_due(target) {
                    self.compact_to(target).await?
                } else {
                    Vec::new()
                };
                (applied, detached)
            }
            CompactionMode::Foreground => {
                // Build over the already-applied prefix while applying the
                // fresh range; the two never touch the same partitions.
                let build_to = prev_applied;
                let (applied, built) = tokio::join!(
                    self.apply_range(prev_applied, target),
                    async {
                        if self.compaction_due(build_to) {
                            self.compact_to(build_to).await
                        } else {
                            Ok(Vec::new())
                        }
                    }
                );
                (applied, built?)
            }
            CompactionMode::Background => (self.apply_range(prev_applied, target).await, Vec::new()),
        };

        self.persist_state()?;
        self.publish();
        drop(guard);

        for partition in detached {
            if let Err(e) = partition.delete() {
                log::warn!(target: "trail", "failed to delete partition file: {e}");
            }
        }

        applied?;
        log::debug!(target: "trail", "committed through index {target} ({count} entries)");
        Ok(count)
    }

    /// Build a snapshot over up to `count` whole partitions of applied
    /// history and detach them, keeping readers and writers unblocked
    /// except for the brief install segment. The effective count is bounded
    /// by [`Self::compaction_count`]. Returns the number of partitions
    /// detached. Meant for `Background` compaction mode but valid in any.
    pub async fn force_compaction(&self, count: u64) -> TrailResult<u64> {
        self.ensure_live()?;
        let count = count.min(self.compaction_count());
        if count == 0 {
            return Ok(0);
        }

        let weak = self.lock.acquire(LockMode::WeakRead).await;
        // The compaction session serializes concurrent compactors.
        let mut session = self.sessions.compaction().await;

        let up_to = {
            let head = match self.partitions.read().unwrap().head() {
                Some(head) => head.number(),
                None => return Ok(0),
            };
            let records = self.options.records_per_partition;
            ((head + count) * records - 1).min(self.last_applied())
        };
        if up_to <= self.snapshot.index() {
            return Ok(0);
        }
        let entry = self.fold_snapshot(&mut session, up_to).await?;
        self.snapshot.write_temp(&entry, up_to)?;
        drop(weak);

        let install = self.lock.acquire(LockMode::Compaction).await;
        // A commit-side compaction may have overtaken this build while the
        // WeakRead lock was down; installing the older snapshot would orphan
        // the indices in between.
        if up_to <= self.snapshot.index() {
            self.snapshot.discard_temp()?;
            return Ok(0);
        }
        self.snapshot.install_temp(up_to)?;
        let detached = self.partitions.write().unwrap().detach_below(up_to);
        drop(install);

        let freed = detached.len() as u64;
        for partition in detached {
            if let Err(e) = partition.delete() {
                log::warn!(target: "trail", "failed to delete partition file: {e}");
            }
        }
        Ok(freed)
    }

    /// Install a snapshot received from the leader, covering every index at
    /// or below `snapshot_index`. Linearizable with all other operations;
    /// idempotent at the same index and payload.
    pub async fn install_snapshot(&self, entry: LogEntry, snapshot_index: u64) -> TrailResult<()> {
        self.ensure_live()?;
        if !entry.is_snapshot {
            return Err(TrailError::InvalidAppend("not a snapshot entry".into()));
        }
        if snapshot_index == 0 {
            return Err(TrailError::InvalidIndex(0));
        }

        let guard = self.lock.acquire(LockMode::Exclusive).await;
        if snapshot_index < self.snapshot.index() {
            return Err(TrailError::InvalidIndex(snapshot_index));
        }

        // The rename inside is the point of no return.
        self.snapshot.write(&entry, snapshot_index)?;

        {
            let mut state = self.state.lock().unwrap();
            state.commit_index = snapshot_index;
            state.last_index = state.last_index.max(snapshot_index);
            state.last_applied = snapshot_index;
            if state.last_index == snapshot_index {
                self.last_entry_term.store(entry.term, Ordering::Relaxed);
            }
        }
        self.applied_term.store(entry.term, Ordering::Relaxed);
        self.persist_state()?;

        self.machine.apply(snapshot_index, &entry).await?;

        let detached = self.partitions.write().unwrap().detach_below(snapshot_index);
        self.publish();
        drop(guard);

        for partition in detached {
            if let Err(e) = partition.delete() {
                log::warn!(target: "trail", "failed to delete partition file: {e}");
            }
        }
        Ok(())
    }

    /// Erase the uncommitted suffix starting at `start_index`. Returns the
    /// number of entries dropped.
    pub async fn drop_tail(&self, start_index: u64) -> TrailResult<u64> {
        self.ensure_live()?;
        let guard = self.lock.acquire(LockMode::Exclusive).await;

        let (commit, last) = {
            let state = self.state.lock().unwrap();
            (state.commit_index, state.last_index)
        };
        if start_index <= commit {
            return Err(TrailError::InvalidAppend(
                "drop below commit index".into(),
            ));
        }
        if start_index > last {
            return Ok(0);
        }

        let detached = self.partitions.write().unwrap().detach_above(start_index - 1);
        for orphan in start_index..=last {
            if let Some(partition) = self.partitions.read().unwrap().find(orphan) {
                partition.clear_slot(orphan)?;
            }
        }

        self.state.lock().unwrap().last_index = start_index - 1;
        self.persist_state()?;
        log::debug!(target: "trail", "dropped tail from {start_index}, last index now {}", start_index - 1);

        drop(guard);
        let count = last - start_index + 1;
        for partition in detached {
            if let Err(e) = partition.delete() {
                log::warn!(target: "trail", "failed to delete partition file: {e}");
            }
        }
        Ok(count)
    }

    /// Reapply the snapshot and every committed entry to the state machine,
    /// in order. The machine must be idempotent with respect to
    /// re-application from a clean state.
    pub async fn replay(&self) -> TrailResult<()> {
        self.ensure_live()?;
        let _guard = self.lock.acquire(LockMode::Exclusive).await;

        let snapshot = self.snapshot.index();
        if snapshot > 0 {
            let mut session = self.sessions.open();
            let read = self.snapshot.read(&mut session);
            self.sessions.close(session);
            let entry = read?;
            self.machine.apply(snapshot, &entry).await?;
            self.applied_term.store(entry.term, Ordering::Relaxed);
        }

        let commit = {
            let mut state = self.state.lock().unwrap();
            state.last_applied = snapshot;
            state.commit_index
        };
        let applied = self.apply_range(snapshot, commit).await;
        self.persist_state()?;
        self.publish();
        applied?;
        log::info!(target: "trail", "replayed state machine through index {commit}");
        Ok(())
    }

    /// Flush dirty partitions and the node state record.
    pub async fn flush(&self) -> TrailResult<()> {
        self.ensure_live()?;
        let _guard = self.lock.acquire(LockMode::Write).await;
        let mut writer = self.sessions.writer().await;
        let partitions: Vec<_> = self.partitions.read().unwrap().iter().cloned().collect();
        for partition in partitions {
            partition.flush(&mut writer)?;
        }
        self.persist_state()
    }

    /// Wake on any commit advance. Returns `false` on timeout.
    pub async fn wait_any_commit(&self, timeout: Duration) -> bool {
        self.signal.wait_any(timeout).await
    }

    /// Wake once `commit_index >= target`. Returns `false` on timeout.
    pub async fn wait_for_commit(&self, target: u64, timeout: Duration) -> bool {
        self.signal.wait_for_index(target, timeout).await
    }

    /// Wait until an entry of the current term has been applied, i.e. the
    /// state machine is consistent with the node's term.
    pub async fn ensure_consistency(&self, timeout: Duration) -> bool {
        self.signal
            .wait_for(|marks| marks.applied_term >= marks.term, timeout)
            .await
    }

    /// Stop accepting operations and flush everything in flight.
    pub async fn dispose(&self) -> TrailResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.lock.acquire(LockMode::Exclusive).await;
        let mut writer = self.sessions.writer().await;
        let partitions: Vec<_> = self.partitions.read().unwrap().iter().cloned().collect();
        for partition in partitions {
            partition.flush(&mut writer)?;
        }
        self.persist_state()
    }

    fn ensure_live(&self) -> TrailResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TrailError::Disposed);
        }
        Ok(())
    }

    fn persist_state(&self) -> TrailResult<()> {
        let state = *self.state.lock().unwrap();
        self.state_file.persist(&state)
    }

    fn publish(&self) {
        let state = *self.state.lock().unwrap();
        self.signal.publish(Watermarks {
            commit_index: state.commit_index,
            term: state.term,
            applied_term: self.applied_term.load(Ordering::Relaxed),
        });
    }

    fn compaction_due(&self, up_to: u64) -> bool {
        up_to.saturating_sub(self.snapshot.index()) >= self.options.records_per_partition
    }

    /// Recover the last-entry and last-applied terms after a restart.
    fn recover_terms(&self, state: &NodeState) -> TrailResult<()> {
        let mut session = self.sessions.open();
        let result = (|| {
            let snapshot = self.snapshot.index();
            let term_of = |session: &mut Session, index: u64| -> TrailResult<u64> {
                if index == 0 {
                    return Ok(0);
                }
                if index <= snapshot && snapshot > 0 {
                    return Ok(self.snapshot.read(session)?.term);
                }
                match self.partitions.read().unwrap().find(index) {
                    Some(partition) => Ok(partition
                        .read(session, index)?
                        .map(|e| e.term)
                        .unwrap_or(0)),
                    None => Ok(0),
                }
            };
            self.last_entry_term
                .store(term_of(&mut session, state.last_index)?, Ordering::Relaxed);
            self.applied_term
                .store(term_of(&mut session, state.last_applied)?, Ordering::Relaxed);
            Ok(())
        })();
        self.sessions.close(session);
        result
    }

    async fn apply_range(&self, from: u64, to: u64) -> TrailResult<()> {
        if to <= from {
            return Ok(());
        }
        let mut session = self.sessions.open();
        let result = self.apply_range_with(&mut session, from, to).await;
        self.sessions.close(session);
        result
    }

    async fn apply_range_with(
        &self,
        session: &mut Session,
        from: u64,
        to: u64,
    ) -> TrailResult<()> {
        let mut cursor: Option<Arc<Partition>> = None;
        for index in from + 1..=to {
            let partition = match &cursor {
                Some(p) if p.first_index() <= index && index <= p.last_index() => p.clone(),
                _ => {
                    if let Some(prev) = cursor.take() {
                        prev.flush(session)?;
                    }
                    let found = self.partitions.read().unwrap().find(index);
                    let Some(p) = found else {
                        log::error!(target: "trail", "no partition owns committed index {index}");
                        return Err(TrailError::MissingPartition(index));
                    };
                    cursor = Some(p.clone());
                    p
                }
            };

            let entry = partition.read(session, index)?.ok_or_else(|| {
                log::error!(target: "trail", "committed index {index} missing from partition");
                TrailError::MissingPartition(index)
            })?;

            self.machine.apply(index, &entry).await?;
            self.state.lock().unwrap().last_applied = index;
            self.applied_term.store(entry.term, Ordering::Relaxed);
            partition.persist_cached(session, index, self.options.cache_eviction)?;
        }
        if let Some(partition) = cursor {
            partition.flush(session)?;
        }
        Ok(())
    }

    /// Fold `(snapshot_index, up_to]` into a fresh builder seeded with the
    /// current snapshot, honoring the builder's cursor advice.
    async fn fold_snapshot(&self, session: &mut Session, up_to: u64) -> TrailResult<LogEntry> {
        let snapshot = self.snapshot.index();
        let start = snapshot + 1;
        let mut builder = self.machine.snapshot_builder();
        let mut term = 0;

        if snapshot > 0 {
            let current = self.snapshot.read(session)?;
            term = current.term;
            builder.apply(snapshot, &current).await?;
        }

        let mut index = start;
        while index <= up_to {
            index = builder
                .adjust_index(start, up_to, index)
                .clamp(index, up_to + 1);
            if index > up_to {
                break;
            }
            let found = self.partitions.read().unwrap().find(index);
            let Some(partition) = found else {
                return Err(TrailError::MissingPartition(index));
            };
            let entry = partition
                .read(session, index)?
                .ok_or(TrailError::MissingPartition(index))?;
            term = term.max(entry.term);
            builder.apply(index, &entry).await?;
            index += 1;
        }

        builder.build(term).await
    }

    /// Build and install a snapshot through `up_to` under the caller's
    /// Exclusive lock, returning the detached partitions for deletion after
    /// release.
    async fn compact_to(&self, up_to: u64) -> TrailResult<Vec<Arc<Partition>>> {
        // Under Exclusive no readers are active, so a pool session is free;
        // taking the compaction session here could deadlock against a
        // background compactor waiting out the Exclusive lock.
        let mut session = self.sessions.open();
        let result = self.fold_snapshot(&mut session, up_to).await;
        self.sessions.close(session);
        let entry = result?;
        self.snapshot.write(&entry, up_to)?;
        let detached = self.partitions.write().unwrap().detach_below(up_to);
        log::info!(
            target: "trail",
            "compacted log through index {up_to}, {} partitions detached",
            detached.len(),
        );
        Ok(detached)
    }
}
