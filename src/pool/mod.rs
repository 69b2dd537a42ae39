//! Per-origin admission control and client lifecycle: token-bucket rate
//! limiting, circuit breaking and the origin-keyed client registry.

pub mod circuit;
pub mod rate;
pub mod registry;

pub use circuit::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState, Rejection,
};
pub use rate::{RateLimiterConfig, TokenBucket};
pub use registry::{ConnectionPool, OriginStats, PoolConfig, PoolStats};
