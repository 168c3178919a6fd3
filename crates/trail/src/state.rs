//! The node state record persisted in `node.state`.
//!
//! A single fixed-size little-endian record:
//!
//! ```text
//! ┌─ term: u64 ─┬─ last_vote: 16 B ─┬─ commit: u64 ─┬─ applied: u64 ─┬─ last: u64 ─┐
//! ```
//!
//! An all-zero vote field means no vote has been cast. The record is flushed
//! on every mutation so restart recovery always observes the latest
//! watermarks.

use crate::fileio;
use common::TrailResult;
use std::fs::{File, OpenOptions};
use std::path::Path;
use uuid::Uuid;

/// Size of the on-disk record in bytes.
pub const STATE_SIZE: usize = 48;

/// File name within the trail directory.
pub const STATE_FILE: &str = "node.state";

/// In-memory copy of the persistent node state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeState {
    pub term: u64,
    pub last_vote: Option<Uuid>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_index: u64,
}

impl NodeState {
    fn to_bytes(&self) -> [u8; STATE_SIZE] {
        let mut buf = [0u8; STATE_SIZE];
        buf[0..8].copy_from_slice(&self.term.to_le_bytes());
        if let Some(vote) = self.last_vote {
            buf[8..24].copy_from_slice(vote.as_bytes());
        }
        buf[24..32].copy_from_slice(&self.commit_index.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_applied.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_index.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; STATE_SIZE]) -> Self {
        let vote = Uuid::from_slice(&buf[8..24]).expect("16-byte slice");
        Self {
            term: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            last_vote: if vote.is_nil() { None } else { Some(vote) },
            commit_index: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            last_applied: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            last_index: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        }
    }

    /// Next writable index.
    pub fn tail_index(&self) -> u64 {
        self.last_index + 1
    }
}

/// Backing file for the node state record.
#[derive(Debug)]
pub struct StateFile {
    file: File,
}

impl StateFile {
    /// Open or create the record, returning the persisted state (or the
    /// zeroed default for a fresh directory).
    pub fn open(dir: &Path) -> TrailResult<(Self, NodeState)> {
        let path = dir.join(STATE_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let state = if file.metadata()?.len() >= STATE_SIZE as u64 {
            let mut buf = [0u8; STATE_SIZE];
            fileio::read_at(&file, &mut buf, 0)?;
            NodeState::from_bytes(&buf)
        } else {
            let state = NodeState::default();
            fileio::write_at(&file, &state.to_bytes(), 0)?;
            file.sync_all()?;
            state
        };

        Ok((Self { file }, state))
    }

    /// Write the record in place and fsync.
    pub fn persist(&self, state: &NodeState) -> TrailResult<()> {
        fileio::write_at(&self.file, &state.to_bytes(), 0)?;
        self.file.sync_data()?;
        Ok(())
    }
}
