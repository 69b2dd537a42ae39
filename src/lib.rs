//! finpool - resilient fetch core for rate-limited market-data APIs
//!
//! Per-origin connection pooling, token-bucket rate limiting, circuit
//! breaking, retrying HTTP clients (async + blocking), concurrency-bounded
//! request batching and bounded-memory chunked streaming.

pub mod batch;
pub mod config;
pub mod http;
pub mod pool;
pub mod stream;

pub use batch::{
    BatchItem, BatchRequest, BatchStrategy, BatchSummary, BatcherConfig, RequestBatcher,
};
pub use config::CoreConfig;
pub use http::{
    BlockingClient, ClientConfig, FetchError, Fetched, Origin, PooledClient, Response, RetryPolicy,
};
pub use pool::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ConnectionPool, PoolConfig, PoolStats,
    RateLimiterConfig, TokenBucket,
};
pub use stream::{StreamConfig, StreamError, StreamingProcessor};
