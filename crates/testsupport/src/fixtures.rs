//! Recording state machine and folding snapshot builder.

use async_trait::async_trait;
use bytes::Bytes;
use common::TrailResult;
use std::sync::{Arc, Mutex};
use trail::{LogEntry, SnapshotBuilder, StateMachine};

/// Build a log entry with a fixed timestamp so assertions are stable.
pub fn entry(term: u64, payload: &str) -> LogEntry {
    let mut entry = LogEntry::new(term, Bytes::copy_from_slice(payload.as_bytes()));
    entry.timestamp = 1_700_000_000_000;
    entry
}

/// Build entries for consecutive indices from `(term, payload)` pairs.
pub fn entries(specs: &[(u64, &str)]) -> Vec<LogEntry> {
    specs.iter().map(|(term, payload)| entry(*term, payload)).collect()
}

/// State machine that records every applied payload in order and folds
/// payloads into a concatenated state string. A snapshot entry replaces the
/// state wholesale, mirroring how a real machine resets from a snapshot.
#[derive(Debug, Default)]
pub struct RecordingMachine {
    applied: Mutex<Vec<(u64, String)>>,
    state: Mutex<String>,
    skip: Option<(u64, u64)>,
}

impl RecordingMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A machine whose snapshot builder skips the given index range.
    pub fn with_skip(skip_from: u64, skip_to: u64) -> Arc<Self> {
        Arc::new(Self {
            skip: Some((skip_from, skip_to)),
            ..Self::default()
        })
    }

    /// Applied `(index, payload)` pairs in apply order.
    pub fn applied(&self) -> Vec<(u64, String)> {
        self.applied.lock().unwrap().clone()
    }

    /// Applied payloads in apply order.
    pub fn applied_payloads(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// The folded state string.
    pub fn state(&self) -> String {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateMachine for RecordingMachine {
    async fn apply(&self, index: u64, entry: &LogEntry) -> TrailResult<()> {
        let payload = String::from_utf8_lossy(&entry.payload).into_owned();
        let mut state = self.state.lock().unwrap();
        if entry.is_snapshot {
            *state = payload.clone();
        } else {
            state.push_str(&payload);
        }
        drop(state);
        self.applied.lock().unwrap().push((index, payload));
        Ok(())
    }

    fn snapshot_builder(&self) -> Box<dyn SnapshotBuilder> {
        match self.skip {
            Some((from, to)) => Box::new(SkippingBuilder::new(from, to)),
            None => Box::new(FoldingBuilder::default()),
        }
    }
}

/// Snapshot builder that concatenates payloads, seeded by the previous
/// snapshot if one exists.
#[derive(Debug, Default)]
pub struct FoldingBuilder {
    state: String,
}

#[async_trait]
impl SnapshotBuilder for FoldingBuilder {
    async fn apply(&mut self, _index: u64, entry: &LogEntry) -> TrailResult<()> {
        let payload = String::from_utf8_lossy(&entry.payload);
        if entry.is_snapshot {
            self.state = payload.into_owned();
        } else {
            self.state.push_str(&payload);
        }
        Ok(())
    }

    async fn build(&mut self, term: u64) -> TrailResult<LogEntry> {
        Ok(LogEntry::snapshot(
            term,
            Bytes::copy_from_slice(self.state.as_bytes()),
        ))
    }
}

/// Snapshot builder wrapper that skips a fixed index range, for exercising
/// the fold cursor advice.
#[derive(Debug)]
pub struct SkippingBuilder {
    inner: FoldingBuilder,
    skip_from: u64,
    skip_to: u64,
}

impl SkippingBuilder {
    pub fn new(skip_from: u64, skip_to: u64) -> Self {
        Self {
            inner: FoldingBuilder::default(),
            skip_from,
            skip_to,
        }
    }
}

#[async_trait]
impl SnapshotBuilder for SkippingBuilder {
    async fn apply(&mut self, index: u64, entry: &LogEntry) -> TrailResult<()> {
        self.inner.apply(index, entry).await
    }

    fn adjust_index(&self, _start: u64, _end: u64, cursor: u64) -> u64 {
        if (self.skip_from..=self.skip_to).contains(&cursor) {
            self.skip_to + 1
        } else {
            cursor
        }
    }

    async fn build(&mut self, term: u64) -> TrailResult<LogEntry> {
        self.inner.build(term).await
    }
}
