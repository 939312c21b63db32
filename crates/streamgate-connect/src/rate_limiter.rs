//! Rate limiting for source run loops
//!
//! Paces `produce_next()` calls with a token bucket so a fast source can
//! not flood the local pipeline. One token is taken per call; bursts up to
//! the bucket capacity pass without waiting.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for source rate limiting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitConfig {
    /// Maximum produce calls per second (0 = unlimited)
    #[serde(default)]
    pub events_per_second: u64,
    /// Extra calls allowed above the steady rate (0 = 10% of the rate, at least 10)
    #[serde(default)]
    pub burst_size: u64,
}

impl RateLimitConfig {
    /// Rate limit with the default burst allowance
    pub fn new(events_per_second: u64) -> Self {
        Self {
            events_per_second,
            burst_size: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_burst(events_per_second: u64, burst_size: u64) -> Self {
        Self {
            events_per_second,
            burst_size,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.events_per_second > 0
    }

    /// Burst allowance after applying the default
    pub fn effective_burst(&self) -> u64 {
        match (self.events_per_second, self.burst_size) {
            (0, _) => 0,
            (rate, 0) => (rate / 10).max(10),
            (_, burst) => burst,
        }
    }
}

/// Token bucket rate limiter
pub struct TokenBucketRateLimiter {
    tokens: AtomicU64,
    /// events_per_second + burst
    capacity: u64,
    refill_rate: u64,
    last_refill: Mutex<Instant>,
    config: RateLimitConfig,
    /// Acquisitions that had to wait
    events_throttled: AtomicU64,
    total_wait_ns: AtomicU64,
}

impl TokenBucketRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = if config.is_enabled() {
            config.events_per_second + config.effective_burst()
        } else {
            u64::MAX
        };

        Self {
            tokens: AtomicU64::new(capacity),
            capacity,
            refill_rate: config.events_per_second,
            last_refill: Mutex::new(Instant::now()),
            config,
            events_throttled: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
        }
    }

    /// Take `count` tokens, waiting for the bucket to refill if needed.
    ///
    /// Returns how long the call waited (zero if no wait was needed).
    pub async fn acquire(&self, count: u64) -> Duration {
        if !self.config.is_enabled() {
            return Duration::ZERO;
        }

        let start = Instant::now();
        loop {
            self.refill().await;

            if self.take(count) {
                let waited = start.elapsed();
                if !waited.is_zero() {
                    self.events_throttled.fetch_add(count, Ordering::Relaxed);
                    self.total_wait_ns
                        .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
                    debug!(waited_ms = waited.as_millis() as u64, count, "Rate limiter throttled");
                }
                return waited;
            }

            let available = self.tokens.load(Ordering::Acquire);
            let needed = count.saturating_sub(available);
            let wait_secs = needed as f64 / self.refill_rate as f64;
            // Never sleep longer than a second between refill checks
            tokio::time::sleep(Duration::from_secs_f64(wait_secs.clamp(0.001, 1.0))).await;
        }
    }

    /// Take `count` tokens if they are available right now
    pub async fn try_acquire(&self, count: u64) -> bool {
        if !self.config.is_enabled() {
            return true;
        }
        self.refill().await;
        self.take(count)
    }

    fn take(&self, count: u64) -> bool {
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < count {
                return false;
            }
            match self.tokens.compare_exchange(
                current,
                current - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    async fn refill(&self) {
        let mut last = self.last_refill.lock().await;
        let elapsed = last.elapsed();
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if tokens_to_add == 0 {
            return;
        }

        let current = self.tokens.load(Ordering::Acquire);
        let refilled = current.saturating_add(tokens_to_add).min(self.capacity);
        self.tokens.store(refilled, Ordering::Release);
        *last = Instant::now();
    }

    pub fn available_tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            events_throttled: self.events_throttled.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ns.load(Ordering::Relaxed) / 1_000_000,
            capacity: self.capacity,
            rate_limit: self.config.events_per_second,
            enabled: self.config.is_enabled(),
        }
    }
}

impl std::fmt::Debug for TokenBucketRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketRateLimiter")
            .field("config", &self.config)
            .field("tokens", &self.available_tokens())
            .finish()
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub events_throttled: u64,
    pub total_wait_ms: u64,
    pub capacity: u64,
    pub rate_limit: u64,
    pub enabled: bool,
}

impl std::fmt::Display for RateLimiterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.enabled {
            write!(
                f,
                "RateLimiter({}eps, {} throttled, {}ms waited)",
                self.rate_limit, self.events_throttled, self.total_wait_ms
            )
        } else {
            write!(f, "RateLimiter(unlimited)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig::unlimited());
        for _ in 0..1000 {
            assert_eq!(limiter.acquire(1).await, Duration::ZERO);
        }
        let stats = limiter.stats();
        assert!(!stats.enabled);
        assert_eq!(stats.to_string(), "RateLimiter(unlimited)");
    }

    #[test]
    fn test_default_burst() {
        assert_eq!(RateLimitConfig::new(1000).effective_burst(), 100);
        assert_eq!(RateLimitConfig::new(50).effective_burst(), 10);
        assert_eq!(RateLimitConfig::with_burst(1000, 500).effective_burst(), 500);
        assert_eq!(RateLimitConfig::unlimited().effective_burst(), 0);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: RateLimitConfig = serde_yaml::from_str("events_per_second: 200").unwrap();
        assert_eq!(config, RateLimitConfig::new(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_drains_bucket() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig::with_burst(10, 5));
        assert!(limiter.try_acquire(15).await);
        assert!(!limiter.try_acquire(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_over_time() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig::with_burst(1000, 1));
        assert!(limiter.try_acquire(1001).await);
        assert_eq!(limiter.available_tokens(), 0);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire(50).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_tokens() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig::with_burst(100, 10));
        assert!(limiter.try_acquire(110).await);

        let waited = limiter.acquire(20).await;
        assert!(waited >= Duration::from_millis(100));
        assert_eq!(limiter.stats().events_throttled, 20);
    }
}
