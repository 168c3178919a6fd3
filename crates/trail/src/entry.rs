//! Log entry model and its fixed on-disk metadata header.

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the entry metadata header in bytes.
pub const METADATA_SIZE: usize = 29;

const FLAG_SNAPSHOT: u8 = 0b0000_0001;
const FLAG_COMMAND_ID: u8 = 0b0000_0010;

/// Fixed-layout metadata stored in front of every payload.
///
/// ```text
/// ┌─ term: u64 ─┬─ timestamp: u64 ─┬─ flags: u8 ─┬─ command_id: u32 ─┬─ length: u64 ─┐
/// ```
///
/// All fields little-endian. Flag bit 0 marks snapshot entries; flag bit 1
/// marks a meaningful `command_id` (zero is a valid id, not a sentinel).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub term: u64,
    pub timestamp: u64,
    flags: u8,
    command_id: u32,
    pub length: u64,
}

impl EntryMeta {
    pub fn new(
        term: u64,
        timestamp: u64,
        is_snapshot: bool,
        command_id: Option<u32>,
        length: u64,
    ) -> Self {
        let mut flags = 0u8;
        if is_snapshot {
            flags |= FLAG_SNAPSHOT;
        }
        if command_id.is_some() {
            flags |= FLAG_COMMAND_ID;
        }
        Self {
            term,
            timestamp,
            flags,
            command_id: command_id.unwrap_or(0),
            length,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.flags & FLAG_SNAPSHOT != 0
    }

    pub fn command_id(&self) -> Option<u32> {
        if self.flags & FLAG_COMMAND_ID != 0 {
            Some(self.command_id)
        } else {
            None
        }
    }

    /// Serialize the header to bytes.
    pub fn to_bytes(&self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        buf[0..8].copy_from_slice(&self.term.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16] = self.flags;
        buf[17..21].copy_from_slice(&self.command_id.to_le_bytes());
        buf[21..29].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Deserialize the header from bytes.
    pub fn from_bytes(buf: &[u8; METADATA_SIZE]) -> Self {
        Self {
            term: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            flags: buf[16],
            command_id: u32::from_le_bytes(buf[17..21].try_into().unwrap()),
            length: u64::from_le_bytes(buf[21..29].try_into().unwrap()),
        }
    }
}

/// A log entry surfaced to callers: metadata plus an owned payload.
///
/// Payloads are `Bytes`, so entries are cheap to clone and never bound to a
/// reader session once returned.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub term: u64,
    /// Unix-epoch milliseconds of creation.
    pub timestamp: u64,
    pub command_id: Option<u32>,
    pub is_snapshot: bool,
    pub payload: Bytes,
}

impl LogEntry {
    /// Create a log-position entry stamped with the current wall clock.
    pub fn new(term: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            term,
            timestamp: now_millis(),
            command_id: None,
            is_snapshot: false,
            payload: payload.into(),
        }
    }

    /// Attach an application-defined type tag.
    pub fn with_command_id(mut self, command_id: u32) -> Self {
        self.command_id = Some(command_id);
        self
    }

    /// Create a snapshot entry. Snapshot entries live only in the snapshot
    /// file and are rejected by the regular append path.
    pub fn snapshot(term: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            term,
            timestamp: now_millis(),
            command_id: None,
            is_snapshot: true,
            payload: payload.into(),
        }
    }

    /// The ephemeral entry at index 0 of every log.
    pub fn initial() -> Self {
        Self {
            term: 0,
            timestamp: 0,
            command_id: None,
            is_snapshot: false,
            payload: Bytes::new(),
        }
    }

    pub(crate) fn from_parts(meta: EntryMeta, payload: Bytes) -> Self {
        Self {
            term: meta.term,
            timestamp: meta.timestamp,
            command_id: meta.command_id(),
            is_snapshot: meta.is_snapshot(),
            payload,
        }
    }

    pub(crate) fn meta(&self) -> EntryMeta {
        EntryMeta::new(
            self.term,
            self.timestamp,
            self.is_snapshot,
            self.command_id,
            self.payload.len() as u64,
        )
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
