use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot cancellation flag shared between clones.
///
/// Used both for coordinator shutdown and for asking a running executor to
/// abort its job.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    inner: Arc<CancelSignalInner>,
}

#[derive(Debug)]
struct CancelSignalInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelSignalInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent `cancel`
        // between the check and the await is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_signal_shared_state() {
        let signal = CancelSignal::new();
        let clone = signal.clone();

        signal.cancel();

        assert!(clone.is_cancelled());
        timeout(Duration::from_secs(1), clone.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_wakes_all_waiters() {
        let signal = CancelSignal::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
            .await
            .expect("waiters did not observe cancellation");
        for result in results {
            result.expect("waiter panicked");
        }
    }

    #[test]
    fn test_default_not_cancelled() {
        assert!(!CancelSignal::default().is_cancelled());
    }
}
