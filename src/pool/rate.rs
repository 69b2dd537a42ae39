//! Token-bucket rate limiter, one per origin.
//!
//! Tokens refill continuously at `refill_per_sec`; admission delays a caller
//! until enough tokens exist but never rejects it outright. Two wait modes
//! share the same accounting: a cooperative `acquire` that suspends the task
//! and a thread-blocking `acquire_blocking` for synchronous callers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for one origin's token bucket.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum burst size in tokens.
    pub capacity: u32,

    /// Continuous refill rate, tokens per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 10.0,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with fractional refill.
///
/// The mutex is only held for the read-modify-write; waiting always happens
/// outside the lock so concurrent callers on the same origin cannot deadlock
/// or convoy behind a sleeper.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: RateLimiterConfig) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            refill_per_sec: config.refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempt admission at `cost` tokens. On denial returns a hint for how
    /// long to wait before the tokens will exist.
    pub fn try_acquire(&self, cost: u32) -> Result<(), Duration> {
        let cost = f64::from(cost);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= cost {
            state.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Cooperative admission: suspends the task (never a worker thread) until
    /// the bucket grants `cost` tokens.
    pub async fn acquire(&self, cost: u32) {
        loop {
            match self.try_acquire(cost) {
                Ok(()) => return,
                Err(hint) => tokio::time::sleep(hint.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// Thread-blocking admission for the synchronous client path.
    pub fn acquire_blocking(&self, cost: u32) {
        loop {
            match self.try_acquire(cost) {
                Ok(()) => return,
                Err(hint) => std::thread::sleep(hint.max(Duration::from_millis(1))),
            }
        }
    }

    /// Current token count, refilled to now. Observability only.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        state.tokens
    }
}
