//! Reader sessions and reusable I/O buffers.
//!
//! A session is the I/O context a single read or apply operation holds: an
//! identity plus a reusable byte buffer, so concurrent readers never share
//! staging memory. The pool holds `max_concurrent_reads + 1` sessions; the
//! WeakRead lock bounds concurrent readers, so a claim never finds the pool
//! empty under valid use. The writer and compaction contexts are
//! distinguished sessions guarded by their own locks because the Write and
//! Compaction lock modes already serialize their holders.

use std::sync::Mutex;

/// A reusable I/O context claimed for a single operation.
#[derive(Debug)]
pub struct Session {
    id: usize,
    buf: Vec<u8>,
}

impl Session {
    fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// A zeroed scratch slice of exactly `len` bytes, reusing the session's
    /// block when it is large enough.
    pub fn buffer(&mut self, len: usize) -> &mut [u8] {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
        &mut self.buf[..len]
    }
}

/// Pool of reader sessions plus the writer and compaction sessions.
#[derive(Debug)]
pub struct SessionPool {
    idle: Mutex<Vec<Session>>,
    writer: tokio::sync::Mutex<Session>,
    compaction: tokio::sync::Mutex<Session>,
}

impl SessionPool {
    pub fn new(max_concurrent_reads: usize, buffer_size: usize, snapshot_buffer_size: usize) -> Self {
        let idle = (0..max_concurrent_reads + 1)
            .map(|id| Session::new(id, buffer_size))
            .collect();
        Self {
            idle: Mutex::new(idle),
            writer: tokio::sync::Mutex::new(Session::new(usize::MAX - 1, buffer_size)),
            compaction: tokio::sync::Mutex::new(Session::new(usize::MAX, snapshot_buffer_size)),
        }
    }

    /// Claim an idle reader session.
    pub fn open(&self) -> Session {
        let mut idle = self.idle.lock().unwrap();
        debug_assert!(!idle.is_empty(), "reader session pool exhausted");
        idle.pop().unwrap_or_else(|| Session::new(usize::MAX - 2, 0))
    }

    /// Return a session to the pool.
    pub fn close(&self, session: Session) {
        self.idle.lock().unwrap().push(session);
    }

    /// The distinguished writer session; callers hold the Write lock.
    pub async fn writer(&self) -> tokio::sync::MutexGuard<'_, Session> {
        self.writer.lock().await
    }

    /// The compaction session with its larger buffer; callers hold the
    /// Compaction or Exclusive lock.
    pub async fn compaction(&self) -> tokio::sync::MutexGuard<'_, Session> {
        self.compaction.lock().await
    }
}
