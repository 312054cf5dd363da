//! Token-bucket rate limiting for external calls
//!
//! A shared limiter protecting per-category rates (one bucket per external
//! API, for instance). `acquire` blocks until the bucket can cover the
//! request; `try_acquire` fails fast for callers configured non-blocking.
//! Bucket state is guarded by one async mutex, so refill-and-take is
//! atomic. Idle buckets are garbage-collected so a long run touching many
//! categories does not accumulate state forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Per-category bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSpec {
    /// Maximum burst size.
    pub capacity: f64,
    /// Tokens replenished per second.
    pub refill_per_sec: f64,
}

#[derive(Debug)]
struct Bucket {
    spec: RateLimitSpec,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn new(spec: RateLimitSpec, now: Instant) -> Self {
        Self {
            spec,
            tokens: spec.capacity,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.spec.refill_per_sec).min(self.spec.capacity);
        self.last_refill = now;
    }

    /// Takes `tokens` if available; otherwise returns the wait before
    /// enough will have accrued.
    fn take(&mut self, tokens: f64, now: Instant) -> Option<Duration> {
        self.refill(now);
        self.last_used = now;
        if self.tokens >= tokens {
            self.tokens -= tokens;
            return None;
        }
        let deficit = tokens - self.tokens;
        Some(Duration::from_secs_f64(deficit / self.spec.refill_per_sec))
    }
}

/// Shared token-bucket limiter keyed by category.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    default_spec: RateLimitSpec,
    /// Buckets idle longer than this are pruned.
    idle_ttl: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(default_spec: RateLimitSpec) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            default_spec,
            idle_ttl: Duration::from_secs(300),
        }
    }

    /// Overrides the bucket parameters for one category.
    pub async fn configure(&self, category: &str, spec: RateLimitSpec) {
        let mut buckets = self.buckets.lock().await;
        buckets.insert(category.to_string(), Bucket::new(spec, Instant::now()));
    }

    /// Blocks until `tokens` can be taken from the category's bucket.
    pub async fn acquire(&self, category: &str, tokens: f64) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                let bucket = buckets
                    .entry(category.to_string())
                    .or_insert_with(|| Bucket::new(self.default_spec, now));
                bucket.take(tokens, now)
            };
            match wait {
                None => return,
                Some(delay) => {
                    tracing::debug!(category, ?delay, "rate limited, waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Takes `tokens` if immediately available.
    pub async fn try_acquire(&self, category: &str, tokens: f64) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets
            .entry(category.to_string())
            .or_insert_with(|| Bucket::new(self.default_spec, now));
        bucket.take(tokens, now).is_none()
    }

    /// Prunes buckets idle longer than the TTL; returns how many were
    /// removed.
    pub async fn collect_idle(&self) -> usize {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_used) < self.idle_ttl);
        before - buckets.len()
    }

    /// Number of live buckets.
    pub async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(capacity: f64, refill: f64) -> RateLimitSpec {
        RateLimitSpec {
            capacity,
            refill_per_sec: refill,
        }
    }

    #[tokio::test]
    async fn test_burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::new(spec(5.0, 1.0));
        for _ in 0..5 {
            assert!(limiter.try_acquire("api", 1.0).await);
        }
        assert!(!limiter.try_acquire("api", 1.0).await);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_refill() {
        let limiter = RateLimiter::new(spec(1.0, 100.0));
        limiter.acquire("api", 1.0).await;
        let start = Instant::now();
        // Bucket empty; 1 token at 100/s refills in ~10ms.
        limiter.acquire("api", 1.0).await;
        assert!(start.elapsed() >= Duration::from_millis(8));
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let limiter = RateLimiter::new(spec(1.0, 0.001));
        assert!(limiter.try_acquire("a", 1.0).await);
        assert!(limiter.try_acquire("b", 1.0).await);
        assert!(!limiter.try_acquire("a", 1.0).await);
    }

    #[tokio::test]
    async fn test_configure_overrides_default() {
        let limiter = RateLimiter::new(spec(1.0, 1.0));
        limiter.configure("big", spec(100.0, 10.0)).await;
        assert!(limiter.try_acquire("big", 50.0).await);
    }

    #[tokio::test]
    async fn test_idle_collection() {
        let mut limiter = RateLimiter::new(spec(1.0, 1.0));
        limiter.idle_ttl = Duration::from_millis(10);
        limiter.try_acquire("stale", 0.5).await;
        assert_eq!(limiter.bucket_count().await, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.collect_idle().await, 1);
        assert_eq!(limiter.bucket_count().await, 0);
    }
}
