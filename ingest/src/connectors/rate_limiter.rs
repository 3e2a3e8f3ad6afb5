use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as Governor,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::error::ConnectorError;
use super::types::Source;

/// Backoff applied when a provider throttles without a usable `Retry-After`.
pub const DEFAULT_THROTTLE_BACKOFF_SECS: u64 = 60;

/// Longest backoff honored from a provider hint. Larger hints are capped.
pub const MAX_THROTTLE_BACKOFF_SECS: u64 = 3600;

/// Sustained rate and burst capacity for one connector.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained requests per second
    pub requests_per_second: f64,

    /// Requests allowed back-to-back before the sustained rate applies
    pub burst: u32,
}

impl RateLimitConfig {
    /// Dropbox: roughly 180 requests/minute per user
    pub fn dropbox() -> Self {
        Self {
            requests_per_second: 3.0,
            burst: 10,
        }
    }

    /// Google Drive: 12,000 queries/minute per project, shared between users
    pub fn google_drive() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
        }
    }

    /// Microsoft Graph: 10,000 requests per 10 minutes per mailbox
    pub fn microsoft_graph() -> Self {
        Self {
            requests_per_second: 15.0,
            burst: 30,
        }
    }

    /// Generic conservative rate limit for unknown services
    pub fn generic() -> Self {
        Self {
            requests_per_second: 2.0,
            burst: 5,
        }
    }

    /// Apply `rate_limit_per_second` / `rate_limit_burst` overrides from a
    /// source's settings. Unusable values keep the preset.
    pub fn from_source(source: &Source, preset: RateLimitConfig) -> Self {
        let requests_per_second = source
            .setting("rate_limit_per_second")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(preset.requests_per_second);
        let burst = source
            .setting("rate_limit_burst")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(preset.burst);

        Self {
            requests_per_second,
            burst,
        }
    }

    fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        let period = if self.requests_per_second.is_finite() && self.requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / self.requests_per_second)
        } else {
            Duration::from_secs(1)
        };

        Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
            .allow_burst(burst)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::generic()
    }
}

/// Token bucket plus a provider-imposed "do not call before" deadline.
///
/// Scoped to one connector so a throttled source never eats another
/// source's budget.
pub struct RateLimiter {
    bucket: Governor<NotKeyed, InMemoryState, DefaultClock>,
    resume_after: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: Governor::direct(config.quota()),
            resume_after: Mutex::new(None),
        }
    }

    /// Block until the backoff deadline has passed and a token is available.
    /// Returns `Cancelled` as soon as the token fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ConnectorError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ConnectorError::Cancelled);
            }

            if let Some(remaining) = self.backoff_remaining() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                    _ = tokio::time::sleep(remaining) => continue,
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                _ = self.bucket.until_ready() => {}
            }

            // A throttle recorded while we queued for a token still applies.
            if self.backoff_remaining().is_none() {
                return Ok(());
            }
        }
    }

    /// Non-blocking check. Consumes a token when it returns true.
    pub fn allow(&self) -> bool {
        if self.backoff_remaining().is_some() {
            return false;
        }
        self.bucket.check().is_ok()
    }

    /// Record a throttling response. A non-positive hint means the provider
    /// gave no usable `Retry-After`, so the default backoff applies; hints
    /// above [`MAX_THROTTLE_BACKOFF_SECS`] are capped.
    pub fn record_throttled(&self, retry_after_secs: i64) {
        let secs = if retry_after_secs <= 0 {
            DEFAULT_THROTTLE_BACKOFF_SECS
        } else {
            (retry_after_secs as u64).min(MAX_THROTTLE_BACKOFF_SECS)
        };

        tracing::warn!(
            retry_after_secs = secs,
            hint = retry_after_secs,
            "Provider throttled, backing off"
        );
        self.throttle_for(Duration::from_secs(secs));
    }

    pub(crate) fn throttle_for(&self, backoff: Duration) {
        let now = Instant::now();
        let deadline = now
            .checked_add(backoff)
            .or_else(|| now.checked_add(Duration::from_secs(MAX_THROTTLE_BACKOFF_SECS)))
            .unwrap_or(now);
        *self.resume_after.lock() = Some(deadline);
    }

    /// Current "do not call before" deadline, if one was ever recorded.
    pub fn resume_after(&self) -> Option<Instant> {
        *self.resume_after.lock()
    }

    pub fn in_backoff(&self) -> bool {
        self.backoff_remaining().is_some()
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let deadline = (*self.resume_after.lock())?;
        deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::generic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn remaining(limiter: &RateLimiter) -> Duration {
        limiter
            .resume_after()
            .unwrap()
            .saturating_duration_since(Instant::now())
    }

    #[test]
    fn test_non_positive_hint_uses_default_backoff() {
        for hint in [0, -5] {
            let limiter = RateLimiter::default();
            limiter.record_throttled(hint);
            let left = remaining(&limiter);
            assert!(left <= Duration::from_secs(60), "hint {}: {:?}", hint, left);
            assert!(left >= Duration::from_secs(59), "hint {}: {:?}", hint, left);
        }
    }

    #[test]
    fn test_positive_hint_is_honored() {
        let limiter = RateLimiter::default();
        limiter.record_throttled(30);
        let left = remaining(&limiter);
        assert!(left <= Duration::from_secs(30));
        assert!(left >= Duration::from_secs(29));
    }

    #[test]
    fn test_huge_hint_is_capped() {
        let limiter = RateLimiter::default();
        limiter.record_throttled(i64::MAX);
        let left = remaining(&limiter);
        assert!(left <= Duration::from_secs(MAX_THROTTLE_BACKOFF_SECS));
        assert!(left >= Duration::from_secs(MAX_THROTTLE_BACKOFF_SECS - 1));
        assert!(!limiter.allow());
    }

    #[test]
    fn test_unrepresentable_backoff_does_not_panic() {
        let limiter = RateLimiter::default();
        limiter.throttle_for(Duration::MAX);
        assert!(limiter.in_backoff());
    }

    #[test]
    fn test_allow_false_during_backoff_true_after() {
        let limiter = RateLimiter::default();
        limiter.throttle_for(Duration::from_millis(200));
        assert!(!limiter.allow());
        assert!(limiter.in_backoff());

        std::thread::sleep(Duration::from_millis(250));
        assert!(!limiter.in_backoff());
        assert!(limiter.allow());
    }

    #[test]
    fn test_allow_exhausts_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 0.1,
            burst: 2,
        });
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_cancelled() {
        let limiter = RateLimiter::default();
        limiter.record_throttled(60);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), limiter.wait(&cancel)).await;
        assert_eq!(result.unwrap(), Err(ConnectorError::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_unblocks_on_cancel_during_backoff() {
        let limiter = RateLimiter::default();
        limiter.record_throttled(60);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), limiter.wait(&cancel)).await;
        assert_eq!(result.unwrap(), Err(ConnectorError::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_honors_backoff_before_tokens() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 1000.0,
            burst: 100,
        });
        limiter.throttle_for(Duration::from_millis(150));

        let started = Instant::now();
        limiter.wait(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_source_overrides() {
        let mut config = HashMap::new();
        config.insert("rate_limit_per_second".to_string(), "7.5".to_string());
        config.insert("rate_limit_burst".to_string(), "zero".to_string());
        let source = Source::new("src-1", "dropbox", config, "auth-1");

        let limits = RateLimitConfig::from_source(&source, RateLimitConfig::dropbox());
        assert_eq!(limits.requests_per_second, 7.5);
        assert_eq!(limits.burst, RateLimitConfig::dropbox().burst);
    }
}
