//! The snapshot file: one entry logically replacing every index at or below
//! its snapshot index.
//!
//! Layout: `[ snapshot_index u64 ][ metadata 29 B ][ payload ]`. A missing
//! file or a zero index word means no snapshot. Replacement writes
//! `snapshot.new`, fsyncs it with the index word written last, then renames
//! over the canonical file; a crash before the rename leaves the old
//! snapshot intact, and a rename failure aborts the process because neither
//! rollback nor forward progress is safe at that point.

use crate::entry::{EntryMeta, LogEntry, METADATA_SIZE};
use crate::fileio;
use crate::session::Session;
use bytes::Bytes;
use common::{TrailError, TrailResult};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const SNAPSHOT_FILE: &str = "snapshot";
pub const SNAPSHOT_TEMP_FILE: &str = "snapshot.new";

#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    /// Zero when no snapshot exists. Stored with release ordering at
    /// install; readers use an acquire load for the emptiness fast path and
    /// do all actual I/O under the WeakRead lock.
    index: AtomicU64,
    buffer_size: usize,
}

impl SnapshotStore {
    /// Load the snapshot footer, discarding any `snapshot.new` left by an
    /// interrupted install.
    pub fn open(dir: &Path, snapshot_buffer_size: usize) -> TrailResult<Self> {
        let temp = dir.join(SNAPSHOT_TEMP_FILE);
        match fs::remove_file(&temp) {
            Ok(()) => log::warn!(target: "trail", "discarded interrupted snapshot install"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let path = dir.join(SNAPSHOT_FILE);
        let index = match File::open(&path) {
            Ok(file) => {
                if file.metadata()?.len() >= (8 + METADATA_SIZE) as u64 {
                    let mut word = [0u8; 8];
                    fileio::read_at(&file, &mut word, 0)?;
                    u64::from_le_bytes(word)
                } else {
                    0
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            index: AtomicU64::new(index),
            buffer_size: snapshot_buffer_size,
        })
    }

    /// Current snapshot index; zero when no snapshot exists.
    pub fn index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    /// Read the snapshot entry. Callers hold WeakRead, so the file cannot be
    /// swapped mid-read.
    pub fn read(&self, session: &mut Session) -> TrailResult<LogEntry> {
        let index = self.index();
        if index == 0 {
            return Err(TrailError::InvalidIndex(0));
        }
        let file = File::open(self.dir.join(SNAPSHOT_FILE))?;

        let mut meta_buf = [0u8; METADATA_SIZE];
        fileio::read_at(&file, &mut meta_buf, 8)?;
        let meta = EntryMeta::from_bytes(&meta_buf);

        let buf = session.buffer(meta.length as usize);
        fileio::read_at(&file, buf, (8 + METADATA_SIZE) as u64)?;
        Ok(LogEntry::from_parts(meta, Bytes::copy_from_slice(buf)))
    }

    /// Stream the snapshot entry to `snapshot.new`. The index word is
    /// written last, so a partial temp file is detectable (index zero).
    pub fn write_temp(&self, entry: &LogEntry, snapshot_index: u64) -> TrailResult<()> {
        let temp = self.dir.join(SNAPSHOT_TEMP_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;

        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        writer.write_all(&[0u8; 8])?;
        writer.write_all(&entry.meta().to_bytes())?;
        writer.write_all(&entry.payload)?;
        writer.flush()?;

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        fileio::write_at(&file, &snapshot_index.to_le_bytes(), 0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Rename `snapshot.new` over the canonical file. The rename is the
    /// point of no return; a failure aborts the process.
    pub fn install_temp(&self, snapshot_index: u64) -> TrailResult<()> {
        let temp = self.dir.join(SNAPSHOT_TEMP_FILE);
        let path = self.dir.join(SNAPSHOT_FILE);
        if let Err(e) = fs::rename(&temp, &path) {
            log::error!(target: "trail", "snapshot rename failed, aborting: {e}");
            std::process::abort();
        }

        let dir = File::open(&self.dir)?;
        dir.sync_all()?;

        self.index.store(snapshot_index, Ordering::Release);
        log::info!(target: "trail", "installed snapshot at index {snapshot_index}");
        Ok(())
    }

    /// Write and atomically install in one step.
    pub fn write(&self, entry: &LogEntry, snapshot_index: u64) -> TrailResult<()> {
        self.write_temp(entry, snapshot_index)?;
        self.install_temp(snapshot_index)
    }

    /// Remove a temp file whose build was overtaken before install.
    pub fn discard_temp(&self) -> TrailResult<()> {
        match fs::remove_file(self.dir.join(SNAPSHOT_TEMP_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
