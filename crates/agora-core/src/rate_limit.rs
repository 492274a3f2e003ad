// Rate limiter
// Token bucket per (tenant, category). Acquire is non-blocking; callers
// retry with jitter and surface `RateLimited` when the bucket stays dry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agora_types::{AgoraError, Result};

use crate::clock::Clock;
use crate::config::RateLimitConfig;

/// Call category a bucket meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    Model,
    Tool,
    Retriever,
}

impl RateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::Model => "model",
            RateCategory::Tool => "tool",
            RateCategory::Retriever => "retriever",
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    buckets: Arc<Mutex<HashMap<(String, RateCategory), Bucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take one token from the tenant's bucket for this category.
    pub fn try_acquire(&self, tenant_id: &str, category: RateCategory) -> Result<()> {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let bucket = buckets
            .entry((tenant_id.to_string(), category))
            .or_insert(Bucket {
                tokens: self.config.capacity as f64,
                last_refill_ms: now,
            });

        let elapsed_secs = now.saturating_sub(bucket.last_refill_ms) as f64 / 1_000.0;
        bucket.tokens = (bucket.tokens + elapsed_secs * self.config.refill_per_sec)
            .min(self.config.capacity as f64);
        bucket.last_refill_ms = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(AgoraError::RateLimited(format!(
                "tenant `{tenant_id}` exhausted {} bucket",
                category.as_str()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn limiter(clock: &ManualClock, capacity: u32, refill: f64) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig {
                capacity,
                refill_per_sec: refill,
            },
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn drains_and_refills() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 2, 1.0);

        assert!(limiter.try_acquire("acme", RateCategory::Model).is_ok());
        assert!(limiter.try_acquire("acme", RateCategory::Model).is_ok());
        assert!(matches!(
            limiter.try_acquire("acme", RateCategory::Model),
            Err(AgoraError::RateLimited(_))
        ));

        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire("acme", RateCategory::Model).is_ok());
    }

    #[test]
    fn buckets_are_isolated_per_tenant_and_category() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 1, 0.0);

        assert!(limiter.try_acquire("acme", RateCategory::Model).is_ok());
        assert!(limiter.try_acquire("acme", RateCategory::Tool).is_ok());
        assert!(limiter.try_acquire("globex", RateCategory::Model).is_ok());
        assert!(limiter.try_acquire("acme", RateCategory::Model).is_err());
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 3, 10.0);
        clock.advance(Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.try_acquire("acme", RateCategory::Tool).is_ok());
        }
        assert!(limiter.try_acquire("acme", RateCategory::Tool).is_err());
    }
}
