//! Single-shot completion latch.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};

/// A one-time completion signal carrying a success/failure outcome.
///
/// One side calls [`done`](Self::done) exactly once (later calls are
/// ignored); the other side calls [`wait`](Self::wait) or
/// [`wait_timeout`](Self::wait_timeout) exactly once. Used for "connected"
/// and "bridge ready" rendezvous where several callbacks race to deliver
/// the first outcome.
pub struct Waiter {
    tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    rx: Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

impl Waiter {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Complete the waiter. The first call wins; the rest are no-ops.
    pub fn done(&self, result: Result<()>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    /// Whether [`done`](Self::done) has been called.
    pub fn is_done(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Wait for completion. Errors if the waiter was already consumed or
    /// the completing side went away without calling `done`.
    pub async fn wait(&self) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| EngineError::Internal("waiter already consumed".into()))?;
        rx.await
            .unwrap_or_else(|_| Err(EngineError::Internal("waiter dropped".into())))
    }

    /// Wait with a deadline. A timeout maps to [`EngineError::Upstream`].
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Upstream(format!(
                "timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn done_then_wait() {
        let w = Waiter::new();
        w.done(Ok(()));
        assert!(w.wait().await.is_ok());
    }

    #[tokio::test]
    async fn first_done_wins() {
        let w = Waiter::new();
        w.done(Err(EngineError::SignalingClosed));
        w.done(Ok(()));
        assert!(w.wait().await.is_err());
    }

    #[tokio::test]
    async fn wait_timeout_elapses() {
        let w = Waiter::new();
        let err = w.wait_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, EngineError::Upstream(_)));
    }

    #[tokio::test]
    async fn wait_unblocks_from_other_task() {
        let w = std::sync::Arc::new(Waiter::new());
        let w2 = w.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            w2.done(Ok(()));
        });
        assert!(w.wait_timeout(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn second_wait_errors() {
        let w = Waiter::new();
        w.done(Ok(()));
        let _ = w.wait().await;
        assert!(w.wait().await.is_err());
    }
}
