//! One-shot readiness signal
//!
//! A latch starts unset, is set at most once and never reverts. Readers can
//! either poll it or await the transition.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct ReadyLatch {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadyLatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark as ready; later calls are no-ops
    pub fn set(&self) {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch is set
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ReadyLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_latch_never_reverts() {
        let latch = ReadyLatch::new();
        assert!(!latch.is_ready());
        latch.set();
        latch.set();
        assert!(latch.is_ready());
        assert!(latch.clone().is_ready());
    }

    #[tokio::test]
    async fn test_wait_resolves_on_set() {
        let latch = ReadyLatch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        latch.set();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter woke up")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_set_is_immediate() {
        let latch = ReadyLatch::new();
        latch.set();
        tokio::time::timeout(Duration::from_secs(1), latch.wait())
            .await
            .unwrap();
    }
}
