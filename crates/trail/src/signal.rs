//! Commit-wait signaling.
//!
//! Waiters observe the trail's watermarks through a watch channel. Each
//! commit (and each term change) publishes a new value, so predicates are
//! re-checked on every wake and a satisfied predicate returns immediately
//! without a further signal.

use std::time::Duration;
use tokio::sync::watch;

/// The values commit waiters may predicate on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Watermarks {
    pub commit_index: u64,
    /// Current Raft term of the node.
    pub term: u64,
    /// Term of the most recently applied entry.
    pub applied_term: u64,
}

#[derive(Debug)]
pub struct CommitSignal {
    tx: watch::Sender<Watermarks>,
}

impl CommitSignal {
    pub fn new(initial: Watermarks) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish new watermarks, waking every waiter.
    pub fn publish(&self, marks: Watermarks) {
        self.tx.send_replace(marks);
    }

    pub fn current(&self) -> Watermarks {
        *self.tx.borrow()
    }

    /// Wake on any commit advance. Returns `false` on timeout.
    pub async fn wait_any(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        rx.mark_unchanged();
        matches!(tokio::time::timeout(timeout, rx.changed()).await, Ok(Ok(())))
    }

    /// Wake once `commit_index >= target`. Returns `false` on timeout.
    pub async fn wait_for_index(&self, target: u64, timeout: Duration) -> bool {
        self.wait_for(move |marks| marks.commit_index >= target, timeout)
            .await
    }

    /// Wake once the predicate holds over the watermarks. Returns `false` on
    /// timeout. Used for consistency waits.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&Watermarks) -> bool,
        timeout: Duration,
    ) -> bool {
        let mut predicate = predicate;
        let mut rx = self.tx.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(move |marks| predicate(marks))).await;
        matches!(result, Ok(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);
    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn satisfied_predicate_returns_without_signal() {
        let signal = CommitSignal::new(Watermarks {
            commit_index: 10,
            ..Default::default()
        });
        assert!(signal.wait_for_index(10, SHORT).await);
        assert!(signal.wait_for_index(3, SHORT).await);
    }

    #[tokio::test]
    async fn waiter_wakes_on_publish() {
        let signal = Arc::new(CommitSignal::new(Watermarks::default()));

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait_for_index(5, LONG).await })
        };
        tokio::task::yield_now().await;

        signal.publish(Watermarks {
            commit_index: 5,
            ..Default::default()
        });
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_returns_false() {
        let signal = CommitSignal::new(Watermarks::default());
        assert!(!signal.wait_for_index(1, SHORT).await);
        assert!(!signal.wait_any(SHORT).await);
    }

    #[tokio::test]
    async fn consistency_predicate() {
        let signal = CommitSignal::new(Watermarks {
            term: 3,
            applied_term: 1,
            ..Default::default()
        });
        assert!(!signal.wait_for(|m| m.applied_term >= m.term, SHORT).await);

        signal.publish(Watermarks {
            term: 3,
            applied_term: 3,
            commit_index: 7,
        });
        assert!(signal.wait_for(|m| m.applied_term >= m.term, SHORT).await);
    }
}
