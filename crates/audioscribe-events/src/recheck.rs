//! Scheduler re-check signal.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-bit "look again" signal from memory releases and task completions to
/// the scheduler loop.
///
/// Triggering both wakes a sleeping scheduler and latches a flag that makes
/// the next cycle synchronize pool state with the hardware immediately
/// instead of waiting for the periodic sync.
#[derive(Debug, Default)]
pub struct RecheckSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl RecheckSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a prompt re-check. Cheap and lock-free; safe from any thread.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Consume the pending request, returning whether one was set.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    /// Wait until the next trigger. Used by the scheduler to cut its sleep
    /// short.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_the_request() {
        let signal = RecheckSignal::new();
        assert!(!signal.take());
        signal.trigger();
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let signal = std::sync::Arc::new(RecheckSignal::new());
        let waiter = std::sync::Arc::clone(&signal);
        let handle = tokio::spawn(async move { waiter.notified().await });
        tokio::task::yield_now().await;
        signal.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }
}
