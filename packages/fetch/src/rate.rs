//! Request pacing shared by every fetcher talking to the same API.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Enforces a minimum interval between requests.
///
/// One gate is shared (via `Arc`) by all dataset workers that hit the same
/// API, so running datasets concurrently never raises the request rate.
/// Waiters are served one at a time: the lock is held while sleeping.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    /// Creates a gate that spaces requests by `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// The configured spacing.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the next request slot and claims it.
    ///
    /// Returns `false` if `cancel` fired while waiting; the slot is not
    /// claimed in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        let mut next = self.next_slot.lock().await;

        if let Some(at) = *next {
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep_until(at) => {}
            }
        }

        *next = Some(Instant::now() + self.interval);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn spaces_consecutive_requests() {
        let gate = RateGate::new(Duration::from_millis(40));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        assert!(gate.acquire(&cancel).await);
        assert!(gate.acquire(&cancel).await);
        assert!(gate.acquire(&cancel).await);

        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn shared_gate_paces_concurrent_callers() {
        let gate = Arc::new(RateGate::new(Duration::from_millis(30)));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let cancel = cancel.clone();
                tokio::spawn(async move { gate.acquire(&cancel).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let gate = RateGate::new(Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        assert!(gate.acquire(&cancel).await);
        cancel.cancel();
        assert!(!gate.acquire(&cancel).await);
    }
}
