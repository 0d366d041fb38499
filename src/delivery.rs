//! Tracking of accepted-but-unconfirmed events.
//!
//! A single [`DeliveryCounter`] is shared (behind an `Arc`) by every
//! component that accepts or delivers events. Shutdown logic polls it until
//! it reaches zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// How often [`DeliveryCounter::wait_idle`] re-checks the counter.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Count of events accepted but not yet confirmed delivered.
///
/// Never goes below zero: decrements that exceed the current value clamp
/// at zero instead of wrapping.
///
/// # Example
///
/// ```
/// use testlens::delivery::DeliveryCounter;
///
/// let counter = DeliveryCounter::new();
/// counter.increment(3);
/// counter.decrement(5);
/// assert_eq!(counter.pending(), 0);
/// ```
#[derive(Debug, Default)]
pub struct DeliveryCounter {
    pending: AtomicU64,
}

impl DeliveryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` accepted events. Returns the new value.
    pub fn increment(&self, n: u64) -> u64 {
        self.pending.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Removes `n` events, clamping at zero. Returns the new value.
    pub fn decrement(&self, n: u64) -> u64 {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(n))
            })
            .unwrap_or(0);
        previous.saturating_sub(n)
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Clears the counter at teardown.
    pub fn reset(&self) {
        self.pending.store(0, Ordering::Release);
    }

    /// Waits until the counter reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if the counter reached zero.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let pending = self.pending();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                debug!("Gave up waiting on {} pending uploads", pending);
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_increment_and_decrement() {
        let counter = DeliveryCounter::new();
        assert_eq!(counter.increment(1), 1);
        assert_eq!(counter.increment(4), 5);
        assert_eq!(counter.decrement(2), 3);
        assert_eq!(counter.pending(), 3);
    }

    #[test]
    fn test_decrement_before_increment_clamps() {
        let counter = DeliveryCounter::new();

        // A delivery confirmation racing ahead of its acceptance
        assert_eq!(counter.decrement(1), 0);
        assert_eq!(counter.pending(), 0);

        counter.increment(1);
        assert_eq!(counter.pending(), 1);
        counter.decrement(10);
        assert_eq!(counter.pending(), 0);
    }

    #[test]
    fn test_reset() {
        let counter = DeliveryCounter::new();
        counter.increment(7);
        counter.reset();
        assert!(counter.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_returns_when_drained() {
        let counter = Arc::new(DeliveryCounter::new());
        counter.increment(2);

        let background = counter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            background.decrement(2);
        });

        assert!(counter.wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_times_out() {
        let counter = DeliveryCounter::new();
        counter.increment(1);

        assert!(!counter.wait_idle(Duration::from_millis(500)).await);
        assert_eq!(counter.pending(), 1);
    }

    #[tokio::test]
    async fn test_wait_idle_ready_without_sleeping() {
        let counter = DeliveryCounter::new();

        let mut wait = tokio_test::task::spawn(counter.wait_idle(Duration::from_secs(5)));
        assert!(tokio_test::assert_ready!(wait.poll()));
    }

    #[tokio::test]
    async fn test_wait_idle_pending_while_busy() {
        let counter = DeliveryCounter::new();
        counter.increment(1);

        let mut wait = tokio_test::task::spawn(counter.wait_idle(Duration::from_secs(5)));
        tokio_test::assert_pending!(wait.poll());
    }
}
