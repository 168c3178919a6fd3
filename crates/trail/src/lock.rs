//! Four-mode async lock over the trail's single logical resource.
//!
//! Compatibility matrix:
//!
//! ```text
//!              WeakRead  Write  Compaction  Exclusive
//! WeakRead        ✓        ✓        ✓          ✗
//! Write           ✓        ✗        ✓          ✗
//! Compaction      ✓        ✓        ✗          ✗
//! Exclusive       ✗        ✗        ✗          ✗
//! ```
//!
//! WeakRead admits unlimited readers and never blocks writers; it only
//! guarantees the partition list is not structurally reorganized underneath
//! the holder. Exclusive is Write and Compaction held together. Pending
//! Write/Compaction/Exclusive acquisitions take priority over new WeakRead
//! admissions so compaction cannot be starved by a steady reader stream.
//!
//! Acquisition futures are cancel-safe: dropping one before it resolves
//! leaves no side effect. Guards release on drop.

use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    WeakRead,
    Write,
    Compaction,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    compaction: bool,
    exclusive: bool,
    /// Write/Compaction/Exclusive acquisitions currently queued. New weak
    /// readers yield while this is non-zero.
    strong_waiters: usize,
}

#[derive(Debug, Default)]
pub struct LockManager {
    state: Mutex<LockState>,
    released: Notify,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `mode`, suspending until it is compatible with all holders.
    pub async fn acquire(&self, mode: LockMode) -> LockGuard<'_> {
        if let Some(guard) = self.try_acquire(mode) {
            return guard;
        }

        let _waiter = StrongWaiter::register(self, mode);
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                let yields = mode == LockMode::WeakRead && state.strong_waiters > 0;
                if !yields && Self::grant(&mut state, mode) {
                    return LockGuard { manager: self, mode };
                }
            }

            notified.await;
        }
    }

    /// Acquire `mode` if it is immediately available.
    pub fn try_acquire(&self, mode: LockMode) -> Option<LockGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        // Honor queued strong waiters on the weak-read fast path.
        if mode == LockMode::WeakRead && state.strong_waiters > 0 {
            return None;
        }
        if Self::grant(&mut state, mode) {
            Some(LockGuard { manager: self, mode })
        } else {
            None
        }
    }

    fn grant(state: &mut LockState, mode: LockMode) -> bool {
        if state.exclusive {
            return false;
        }
        match mode {
            LockMode::WeakRead => {
                state.readers += 1;
                true
            }
            LockMode::Write => {
                if state.writer {
                    return false;
                }
                state.writer = true;
                true
            }
            LockMode::Compaction => {
                if state.compaction {
                    return false;
                }
                state.compaction = true;
                true
            }
            LockMode::Exclusive => {
                if state.readers > 0 || state.writer || state.compaction {
                    return false;
                }
                state.exclusive = true;
                true
            }
        }
    }

    fn release(&self, mode: LockMode) {
        {
            let mut state = self.state.lock().unwrap();
            match mode {
                LockMode::WeakRead => state.readers -= 1,
                LockMode::Write => state.writer = false,
                LockMode::Compaction => state.compaction = false,
                LockMode::Exclusive => state.exclusive = false,
            }
        }
        self.released.notify_waiters();
    }
}

/// Scoped lock ownership; the critical section is the guard's lifetime.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    mode: LockMode,
}

impl LockGuard<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.mode);
    }
}

/// Registration of a queued strong acquisition. Dropping it (grant or
/// cancellation) unblocks weak readers again.
struct StrongWaiter<'a> {
    manager: Option<&'a LockManager>,
}

impl<'a> StrongWaiter<'a> {
    fn register(manager: &'a LockManager, mode: LockMode) -> Self {
        if mode == LockMode::WeakRead {
            return Self { manager: None };
        }
        manager.state.lock().unwrap().strong_waiters += 1;
        Self {
            manager: Some(manager),
        }
    }
}

impl Drop for StrongWaiter<'_> {
    fn drop(&mut self) {
        if let Some(manager) = self.manager {
            manager.state.lock().unwrap().strong_waiters -= 1;
            manager.released.notify_waiters();
        }
    }
}
