//! Partition files and the ordered partition list.
//!
//! A partition is a file named by its decimal partition number `p`, holding
//! up to `R` entries for indices `[p*R, p*R + R - 1]`:
//!
//! ```text
//! ┌───────── header ─────────┐┌─ slot 0 ─┐┌─ slot 1 ─┐ … ┌─ slot R−1 ─┐
//! [ R x u64 absolute offsets ][meta|payload][meta|payload] …
//! ```
//!
//! Offset zero marks an empty slot. Appending writes the record at the file
//! tail first and publishes the slot offset second, so a reader can never
//! observe a partially written entry. The file grows monotonically; dead
//! bytes left by overwrites are reclaimed only when the whole partition is
//! dropped.

use crate::entry::{EntryMeta, LogEntry, METADATA_SIZE};
use crate::fileio;
use crate::session::Session;
use bytes::Bytes;
use common::{CacheEviction, Options, TrailError, TrailResult};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Cached {
    meta: EntryMeta,
    payload: Bytes,
    /// The record has been copied to disk; the payload is only kept for
    /// fast reads until eviction.
    persisted: bool,
    /// Drop the payload when the partition next flushes.
    evict_on_flush: bool,
}

#[derive(Debug)]
struct Inner {
    /// In-memory copy of the slot offset table.
    offsets: Box<[u64]>,
    /// Cached payloads of uncommitted entries, one slot per record.
    cache: Box<[Option<Cached>]>,
    /// Current file tail, where the next record is appended.
    tail: u64,
    dirty: bool,
}

/// One contiguous run of `R` entries backed by a single file.
#[derive(Debug)]
pub struct Partition {
    number: u64,
    records: u64,
    path: PathBuf,
    file: File,
    write_through: bool,
    inner: Mutex<Inner>,
}

impl Partition {
    /// Create the partition file for `number`, writing an all-zero header.
    pub fn create(dir: &Path, number: u64, options: &Options) -> TrailResult<Self> {
        let records = options.records_per_partition;
        let path = dir.join(number.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let header = header_size(records);
        fileio::write_at(&file, &vec![0u8; header as usize], 0)?;
        if options.initial_partition_size > header {
            file.set_len(options.initial_partition_size)?;
        }

        log::debug!(target: "trail", "created partition {number}");
        Ok(Self {
            number,
            records,
            path,
            file,
            write_through: options.write_through,
            inner: Mutex::new(Inner {
                offsets: vec![0u64; records as usize].into_boxed_slice(),
                cache: vec![None; records as usize].into_boxed_slice(),
                tail: header,
                dirty: false,
            }),
        })
    }

    /// Open an existing partition file, rebuilding the in-memory offset
    /// table from its header.
    pub fn open(dir: &Path, number: u64, options: &Options) -> TrailResult<Self> {
        let records = options.records_per_partition;
        let path = dir.join(number.to_string());
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let header = header_size(records);
        let len = file.metadata()?.len();
        let mut offsets = vec![0u64; records as usize];
        if len >= header {
            let mut buf = vec![0u8; header as usize];
            fileio::read_at(&file, &mut buf, 0)?;
            for (slot, chunk) in buf.chunks_exact(8).enumerate() {
                offsets[slot] = u64::from_le_bytes(chunk.try_into().unwrap());
            }
        } else {
            // Interrupted creation; restore the empty header.
            fileio::write_at(&file, &vec![0u8; header as usize], 0)?;
        }

        Ok(Self {
            number,
            records,
            path,
            file,
            write_through: options.write_through,
            inner: Mutex::new(Inner {
                offsets: offsets.into_boxed_slice(),
                cache: vec![None; records as usize].into_boxed_slice(),
                tail: len.max(header),
                dirty: false,
            }),
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// First index this partition owns.
    pub fn first_index(&self) -> u64 {
        self.number * self.records
    }

    /// Last index this partition owns.
    pub fn last_index(&self) -> u64 {
        self.first_index() + self.records - 1
    }

    fn slot(&self, index: u64) -> TrailResult<usize> {
        if index < self.first_index() || index > self.last_index() {
            return Err(TrailError::InvalidIndex(index));
        }
        Ok((index - self.first_index()) as usize)
    }

    /// Append the record and publish the slot offset. Does not flush unless
    /// the trail runs write-through.
    pub fn write(&self, session: &mut Session, entry: &LogEntry, index: u64) -> TrailResult<()> {
        let slot = self.slot(index)?;
        let meta = entry.meta();
        let offset = self.append_record(session, &meta, &entry.payload)?;
        self.publish_slot(slot, offset)?;

        let mut inner = self.inner.lock().unwrap();
        inner.cache[slot] = None;
        inner.dirty = true;
        drop(inner);

        if self.write_through {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Keep the payload in the cache slot and defer the disk write to the
    /// next flush boundary. Lowers commit latency for leaders that commit
    /// the entry they just appended.
    pub fn write_cached(&self, entry: &LogEntry, index: u64) -> TrailResult<()> {
        let slot = self.slot(index)?;
        let mut inner = self.inner.lock().unwrap();
        inner.cache[slot] = Some(Cached {
            meta: entry.meta(),
            payload: entry.payload.clone(),
            persisted: false,
            evict_on_flush: false,
        });
        inner.dirty = true;
        Ok(())
    }

    /// Read the entry at `index`, `None` when the slot is empty. Cached
    /// payloads are served without touching the disk.
    pub fn read(&self, session: &mut Session, index: u64) -> TrailResult<Option<LogEntry>> {
        let slot = self.slot(index)?;
        let offset = {
            let inner = self.inner.lock().unwrap();
            if let Some(cached) = &inner.cache[slot] {
                return Ok(Some(LogEntry::from_parts(cached.meta, cached.payload.clone())));
            }
            inner.offsets[slot]
        };
        if offset == 0 {
            return Ok(None);
        }

        let mut meta_buf = [0u8; METADATA_SIZE];
        fileio::read_at(&self.file, &mut meta_buf, offset)?;
        let meta = EntryMeta::from_bytes(&meta_buf);

        let buf = session.buffer(meta.length as usize);
        fileio::read_at(&self.file, buf, offset + METADATA_SIZE as u64)?;
        let payload = Bytes::copy_from_slice(buf);
        Ok(Some(LogEntry::from_parts(meta, payload)))
    }

    /// Ensure a cached entry is on disk, then release or keep the payload
    /// per the eviction policy.
    pub fn persist_cached(
        &self,
        session: &mut Session,
        index: u64,
        policy: CacheEviction,
    ) -> TrailResult<()> {
        let slot = self.slot(index)?;
        let pending = {
            let inner = self.inner.lock().unwrap();
            match &inner.cache[slot] {
                Some(cached) if !cached.persisted => {
                    Some((cached.meta, cached.payload.clone()))
                }
                Some(_) => None,
                None => return Ok(()),
            }
        };

        if let Some((meta, payload)) = pending {
            let offset = self.append_record(session, &meta, &payload)?;
            self.publish_slot(slot, offset)?;
        }

        let mut inner = self.inner.lock().unwrap();
        match policy {
            CacheEviction::OnCommit => {
                inner.cache[slot] = None;
            }
            CacheEviction::OnFlush => {
                if let Some(cached) = &mut inner.cache[slot] {
                    cached.persisted = true;
                    cached.evict_on_flush = true;
                }
            }
        }
        inner.dirty = true;
        Ok(())
    }

    /// Persist pending cached entries, rewrite the header, and fsync.
    pub fn flush(&self, session: &mut Session) -> TrailResult<()> {
        let pending: Vec<(usize, EntryMeta, Bytes)> = {
            let inner = self.inner.lock().unwrap();
            if !inner.dirty {
                return Ok(());
            }
            inner
                .cache
                .iter()
                .enumerate()
                .filter_map(|(slot, cached)| match cached {
                    Some(c) if !c.persisted => Some((slot, c.meta, c.payload.clone())),
                    _ => None,
                })
                .collect()
        };

        for (slot, meta, payload) in &pending {
            let offset = self.append_record(session, meta, payload)?;
            self.publish_slot(*slot, offset)?;
        }

        let mut inner = self.inner.lock().unwrap();
        for (slot, _, _) in &pending {
            if let Some(cached) = &mut inner.cache[*slot] {
                cached.persisted = true;
            }
        }
        for cached in inner.cache.iter_mut() {
            if cached.as_ref().is_some_and(|c| c.evict_on_flush && c.persisted) {
                *cached = None;
            }
        }
        inner.dirty = false;
        drop(inner);

        self.file.sync_data()?;
        Ok(())
    }

    /// Zero the slot offset on disk and in memory and drop any cached
    /// payload. Used when a tail rewrite or drop orphans the index.
    pub fn clear_slot(&self, index: u64) -> TrailResult<()> {
        let slot = self.slot(index)?;
        fileio::write_at(&self.file, &0u64.to_le_bytes(), slot as u64 * 8)?;
        let mut inner = self.inner.lock().unwrap();
        inner.offsets[slot] = 0;
        inner.cache[slot] = None;
        inner.dirty = true;
        Ok(())
    }

    /// Whether any slot holds an entry.
    pub fn is_vacant(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.offsets.iter().all(|&o| o == 0) && inner.cache.iter().all(|c| c.is_none())
    }

    /// Delete the backing file. Called after the structural lock is
    /// released; open reader handles stay valid until dropped.
    pub fn delete(&self) -> TrailResult<()> {
        log::debug!(target: "trail", "dropping partition {}", self.number);
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn append_record(
        &self,
        session: &mut Session,
        meta: &EntryMeta,
        payload: &[u8],
    ) -> TrailResult<u64> {
        let total = METADATA_SIZE + payload.len();
        let offset = {
            let mut inner = self.inner.lock().unwrap();
            let offset = inner.tail;
            inner.tail += total as u64;
            offset
        };

        let buf = session.buffer(total);
        buf[..METADATA_SIZE].copy_from_slice(&meta.to_bytes());
        buf[METADATA_SIZE..].copy_from_slice(payload);
        fileio::write_at(&self.file, buf, offset)?;
        Ok(offset)
    }

    fn publish_slot(&self, slot: usize, offset: u64) -> TrailResult<()> {
        fileio::write_at(&self.file, &offset.to_le_bytes(), slot as u64 * 8)?;
        let mut inner = self.inner.lock().unwrap();
        inner.offsets[slot] = offset;
        Ok(())
    }
}

fn header_size(records: u64) -> u64 {
    records * 8
}

/// Sorted collection of live partitions, keyed by partition number.
///
/// Lookup is by owning partition number; linked traversal exists only to
/// detach a fully-covered head segment or a dropped tail. Structural
/// mutation requires the Compaction or Exclusive lock; `get_or_create`
/// requires Write.
#[derive(Debug, Default)]
pub struct PartitionList {
    records: u64,
    map: BTreeMap<u64, Arc<Partition>>,
}

impl PartitionList {
    pub fn new(records: u64) -> Self {
        Self {
            records,
            map: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, partition: Arc<Partition>) {
        self.map.insert(partition.number(), partition);
    }

    /// The partition owning `index`, if it exists.
    pub fn find(&self, index: u64) -> Option<Arc<Partition>> {
        self.map.get(&(index / self.records)).cloned()
    }

    /// The partition owning `index`, created lazily.
    pub fn get_or_create(
        &mut self,
        index: u64,
        dir: &Path,
        options: &Options,
    ) -> TrailResult<Arc<Partition>> {
        let number = index / self.records;
        if let Some(partition) = self.map.get(&number) {
            return Ok(partition.clone());
        }
        let partition = Arc::new(Partition::create(dir, number, options)?);
        self.map.insert(number, partition.clone());
        Ok(partition)
    }

    /// Unlink every partition whose whole range is at or below `index`.
    /// The caller deletes the returned files after releasing its lock.
    pub fn detach_below(&mut self, index: u64) -> Vec<Arc<Partition>> {
        let keys: Vec<u64> = self
            .map
            .values()
            .take_while(|p| p.last_index() <= index)
            .map(|p| p.number())
            .collect();
        keys.iter().filter_map(|k| self.map.remove(k)).collect()
    }

    /// Unlink every partition whose whole range is above `index`.
    pub fn detach_above(&mut self, index: u64) -> Vec<Arc<Partition>> {
        let keys: Vec<u64> = self
            .map
            .values()
            .rev()
            .take_while(|p| p.first_index() > index)
            .map(|p| p.number())
            .collect();
        keys.iter().filter_map(|k| self.map.remove(k)).collect()
    }

    /// Oldest live partition.
    pub fn head(&self) -> Option<Arc<Partition>> {
        self.map.values().next().cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Partition>> {
        self.map.values()
    }
}
