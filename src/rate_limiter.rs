//! Per-agent token-bucket rate limiting.
//!
//! The teacher crate has no rate limiter of its own; this module follows
//! its concurrency idiom (`dashmap` for the shared map, `parking_lot` for
//! the per-entry lock) rather than introducing a new dependency family.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Static configuration for one agent's bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity and the steady-state refill rate (tokens/sec).
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 1.0,
        }
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    /// Adaptive multiplier applied to `refill_per_sec`, bounded to
    /// `[0.1, 2.0]` of the configured base rate.
    rate_multiplier: f64,
    /// Consecutive successes since the last widen or throttle; the
    /// multiplier only widens once this reaches 5.
    consecutive_successes: u32,
}

impl Bucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.capacity,
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            last_refill: Instant::now(),
            rate_multiplier: 1.0,
            consecutive_successes: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let effective_rate = self.refill_per_sec * self.rate_multiplier;
        self.tokens = (self.tokens + elapsed * effective_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, cost: f64) -> Option<Duration> {
        let now = Instant::now();
        self.refill(now);

        if self.tokens >= cost {
            self.tokens -= cost;
            return None;
        }

        let deficit = cost - self.tokens;
        let effective_rate = (self.refill_per_sec * self.rate_multiplier).max(f64::EPSILON);
        Some(Duration::from_secs_f64(deficit / effective_rate))
    }

    /// Narrow the refill rate immediately on a throttle signal from the
    /// provider; widen it only after 5 consecutive successes. Bounded to
    /// `[0.1, 2.0]` of base.
    fn adapt(&mut self, throttled: bool) {
        if throttled {
            self.consecutive_successes = 0;
            self.rate_multiplier = (self.rate_multiplier * 0.5).max(0.1);
            return;
        }

        self.consecutive_successes += 1;
        if self.consecutive_successes >= 5 {
            self.consecutive_successes = 0;
            self.rate_multiplier = (self.rate_multiplier * 1.1).min(2.0);
        }
    }
}

/// A registry of per-agent token buckets.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    defaults: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(defaults: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, agent: impl Into<String>, config: RateLimitConfig) -> Self {
        self.overrides.insert(agent.into(), config);
        self
    }

    fn config_for(&self, agent: &str) -> RateLimitConfig {
        self.overrides.get(agent).copied().unwrap_or(self.defaults)
    }

    /// Acquire `cost` tokens for `agent`, sleeping as needed. Returns the
    /// wait duration actually incurred (`Duration::ZERO` if immediate).
    pub async fn acquire(&self, agent: &str, cost: f64) -> Duration {
        loop {
            let wait = {
                let entry = self
                    .buckets
                    .entry(agent.to_string())
                    .or_insert_with(|| Mutex::new(Bucket::new(self.config_for(agent))));
                let mut bucket = entry.lock();
                bucket.try_acquire(cost)
            };

            match wait {
                None => return Duration::ZERO,
                Some(delay) => {
                    trace!(agent, delay_ms = delay.as_millis() as u64, "rate limiter waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Non-blocking variant: returns `true` if tokens were available and
    /// consumed, `false` if the caller would have had to wait.
    pub fn try_acquire(&self, agent: &str, cost: f64) -> bool {
        let entry = self
            .buckets
            .entry(agent.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(self.config_for(agent))));
        let mut bucket = entry.lock();
        bucket.try_acquire(cost).is_none()
    }

    /// Record whether the most recent call to `agent` was throttled by the
    /// provider, adapting the effective refill rate for next time.
    pub fn record_outcome(&self, agent: &str, throttled: bool) {
        let entry = self
            .buckets
            .entry(agent.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(self.config_for(agent))));
        let mut bucket = entry.lock();
        bucket.adapt(throttled);
        debug!(agent, throttled, multiplier = bucket.rate_multiplier, "rate limiter adapted");
    }

    pub fn current_multiplier(&self, agent: &str) -> f64 {
        self.buckets
            .get(agent)
            .map(|entry| entry.lock().rate_multiplier)
            .unwrap_or(1.0)
    }
}
