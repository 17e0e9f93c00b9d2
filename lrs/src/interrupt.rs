//! Pull-style task cancellation.
//!
//! Every session task holds an [`Interrupt`] and checks it at its
//! suspension points (socket waits, sleeps, cond-var waits). `stop()` is
//! idempotent: it raises the flag and wakes any parked waiter, and the
//! task finalizes at its next suspension.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Interrupt {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        // send_replace never fails even with no receivers.
        let _ = self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Parks until stopped; combine with `select!` around other waits.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_wakes_waiter() {
        let interrupt = Interrupt::new();
        let waiter = interrupt.clone();
        let handle = tokio::spawn(async move {
            waiter.stopped().await;
            true
        });
        tokio::task::yield_now().await;
        interrupt.stop();
        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let interrupt = Interrupt::new();
        interrupt.stop();
        interrupt.stop();
        assert!(interrupt.is_stopped());
        interrupt.stopped().await; // returns immediately
    }

    #[tokio::test]
    async fn test_stop_before_wait_does_not_hang() {
        let interrupt = Interrupt::new();
        interrupt.stop();
        tokio::time::timeout(Duration::from_secs(1), interrupt.stopped())
            .await
            .unwrap();
    }
}
