//! Retry and pacing parameters.

use std::time::Duration;

/// Minimum spacing between two requests against the same API.
///
/// The upstream ban threshold sits close to this value; lowering it is a
/// correctness change, not a tuning knob.
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_millis(3500);

/// Attempts per page before a transient failure is final.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Retry and pacing policy for a [`crate::RetryingFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Minimum spacing between consecutive requests.
    pub request_interval: Duration,
    /// Maximum attempts for network, 5xx, and body-decode failures.
    pub max_attempts: u32,
    /// First transient backoff; doubles per failed attempt.
    pub backoff_base: Duration,
    /// Upper bound for transient backoff.
    pub backoff_cap: Duration,
    /// First rate-limit backoff; doubles per consecutive 429.
    pub rate_limit_backoff_base: Duration,
    /// Upper bound for rate-limit backoff.
    pub rate_limit_backoff_cap: Duration,
    /// How many 429 responses one page may absorb before the page fails.
    pub max_rate_limit_escalations: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            request_interval: DEFAULT_REQUEST_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            rate_limit_backoff_base: Duration::from_secs(4),
            rate_limit_backoff_cap: Duration::from_secs(300),
            max_rate_limit_escalations: 6,
            timeout: Duration::from_secs(180),
            user_agent: concat!("bronze-ingest/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchPolicy {
    /// Delay before retrying after the `failures`-th transient failure
    /// (1-based): `base`, `2 × base`, `4 × base`, … capped.
    #[must_use]
    pub fn transient_backoff(&self, failures: u32) -> Duration {
        exponential(self.backoff_base, failures).min(self.backoff_cap)
    }

    /// Delay before retrying after the `escalation`-th consecutive 429
    /// (1-based).
    ///
    /// A server `Retry-After` hint replaces the exponential value. Either
    /// way the result is never shorter than twice the request interval.
    #[must_use]
    pub fn rate_limit_backoff(&self, escalation: u32, hint: Option<Duration>) -> Duration {
        let delay = hint
            .unwrap_or_else(|| exponential(self.rate_limit_backoff_base, escalation))
            .min(self.rate_limit_backoff_cap);
        delay.max(self.request_interval.saturating_mul(2))
    }
}

fn exponential(base: Duration, step: u32) -> Duration {
    let shift = step.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_backoff_doubles_then_caps() {
        let policy = FetchPolicy::default();
        assert_eq!(policy.transient_backoff(1), Duration::from_secs(2));
        assert_eq!(policy.transient_backoff(2), Duration::from_secs(4));
        assert_eq!(policy.transient_backoff(4), Duration::from_secs(16));
        assert_eq!(policy.transient_backoff(10), Duration::from_secs(60));
    }

    #[test]
    fn rate_limit_backoff_exceeds_request_interval() {
        let policy = FetchPolicy::default();
        let first = policy.rate_limit_backoff(1, None);
        assert!(first > policy.request_interval);
        assert_eq!(first, Duration::from_secs(7));
        assert_eq!(policy.rate_limit_backoff(3, None), Duration::from_secs(16));
        assert_eq!(policy.rate_limit_backoff(30, None), Duration::from_secs(300));
    }

    #[test]
    fn rate_limit_hint_wins_over_exponential() {
        let policy = FetchPolicy::default();
        assert_eq!(
            policy.rate_limit_backoff(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.rate_limit_backoff(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(300)
        );
    }
}
