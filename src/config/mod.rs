use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::batch::{BatcherConfig, BatchStrategy};
use crate::http::client::ClientConfig;
use crate::http::RetryPolicy;
use crate::pool::{CircuitBreakerConfig, PoolConfig, RateLimiterConfig};
use crate::stream::StreamConfig;

/// Rate limiter settings (token bucket per origin)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Maximum burst size in tokens
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,

    /// Refill rate in tokens per second
    #[serde(default = "default_rate_refill")]
    pub refill_per_sec: f64,
}

fn default_rate_capacity() -> u32 {
    10
}

fn default_rate_refill() -> f64 {
    10.0
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_sec: default_rate_refill(),
        }
    }
}

/// Retry policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Total attempts per logical request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the exponential delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter fraction of the base delay added per sleep
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Status codes worth another attempt
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_jitter_fraction() -> f64 {
    0.2
}

fn default_retryable_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Consecutive terminal failures before opening
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Base cooldown before a trial is admitted, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Cap on the grown cooldown, in seconds
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,

    /// Whether retried (non-final) failures count toward the trip threshold
    #[serde(default)]
    pub count_transient_failures: bool,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_max_cooldown_secs() -> u64 {
    300
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
            count_transient_failures: false,
        }
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    /// Per-attempt deadline in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Idle keep-alive connections retained per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Headers injected into every request (static auth and friends)
    #[serde(default)]
    pub default_headers: HashMap<String, String>,
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_max_idle_per_host() -> usize {
    32
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_idle_per_host: default_max_idle_per_host(),
            default_headers: HashMap::new(),
        }
    }
}

/// Connection pool registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Idle TTL for origin entries, in seconds
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// Background sweep interval, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_idle_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Request batcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    /// Requests per window
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Concurrency cap within a window
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Strategy: "fixed" or "adaptive"
    #[serde(default = "default_batch_strategy")]
    pub strategy: String,

    /// Optional overall deadline per submission, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_timeout_secs: Option<u64>,
}

fn default_max_batch_size() -> usize {
    10
}

fn default_max_concurrent() -> usize {
    3
}

fn default_batch_strategy() -> String {
    "adaptive".to_string()
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_concurrent: default_max_concurrent(),
            strategy: default_batch_strategy(),
            batch_timeout_secs: None,
        }
    }
}

/// Streaming processor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    /// Records or bytes per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Buffer size for underlying reads
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_buffer_size() -> usize {
    8192
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub rate_limit: RateLimitSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub http: HttpSection,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub batch: BatchSection,

    #[serde(default)]
    pub stream: StreamSection,
}

impl CoreConfig {
    /// Client configuration for one origin, derived from the shared sections.
    pub fn client_config(&self) -> ClientConfig {
        let mut default_headers: Vec<(String, String)> = ClientConfig::default().default_headers;
        for (name, value) in &self.http.default_headers {
            default_headers.push((name.clone(), value.clone()));
        }
        ClientConfig {
            request_timeout: Duration::from_secs(self.http.request_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter_fraction: self.retry.jitter_fraction,
                retryable_statuses: self
                    .retry
                    .retryable_statuses
                    .iter()
                    .filter_map(|&code| hyper::StatusCode::from_u16(code).ok())
                    .collect(),
            },
            rate: RateLimiterConfig {
                capacity: self.rate_limit.capacity,
                refill_per_sec: self.rate_limit.refill_per_sec,
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                cooldown: Duration::from_secs(self.breaker.cooldown_secs),
                max_cooldown: Duration::from_secs(self.breaker.max_cooldown_secs),
                count_transient_failures: self.breaker.count_transient_failures,
            },
            default_headers,
            max_idle_per_host: self.http.max_idle_per_host,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            idle_ttl: Duration::from_secs(self.pool.idle_ttl_secs),
            sweep_interval: Duration::from_secs(self.pool.sweep_interval_secs),
        }
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            max_batch_size: self.batch.max_batch_size,
            max_concurrent: self.batch.max_concurrent,
            strategy: match self.batch.strategy.as_str() {
                "fixed" => BatchStrategy::Fixed,
                _ => BatchStrategy::Adaptive,
            },
            batch_timeout: self.batch.batch_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            chunk_size: self.stream.chunk_size,
            buffer_size: self.stream.buffer_size,
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<CoreConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: CoreConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Supported variables (all optional, defaults apply otherwise):
/// - FINPOOL_RATE_CAPACITY / FINPOOL_RATE_REFILL_PER_SEC
/// - FINPOOL_MAX_ATTEMPTS / FINPOOL_BASE_DELAY_MS / FINPOOL_MAX_DELAY_MS
/// - FINPOOL_FAILURE_THRESHOLD / FINPOOL_COOLDOWN_SECS
/// - FINPOOL_REQUEST_TIMEOUT_SECS
/// - FINPOOL_IDLE_TTL_SECS
/// - FINPOOL_MAX_BATCH_SIZE / FINPOOL_MAX_CONCURRENT / FINPOOL_BATCH_STRATEGY
/// - FINPOOL_CHUNK_SIZE
pub fn load_from_env() -> Result<CoreConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = CoreConfig::default();

    fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
        if let Ok(raw) = std::env::var(name) {
            if let Ok(value) = raw.parse() {
                *target = value;
            }
        }
    }

    env_parse("FINPOOL_RATE_CAPACITY", &mut config.rate_limit.capacity);
    env_parse(
        "FINPOOL_RATE_REFILL_PER_SEC",
        &mut config.rate_limit.refill_per_sec,
    );
    env_parse("FINPOOL_MAX_ATTEMPTS", &mut config.retry.max_attempts);
    env_parse("FINPOOL_BASE_DELAY_MS", &mut config.retry.base_delay_ms);
    env_parse("FINPOOL_MAX_DELAY_MS", &mut config.retry.max_delay_ms);
    env_parse(
        "FINPOOL_FAILURE_THRESHOLD",
        &mut config.breaker.failure_threshold,
    );
    env_parse("FINPOOL_COOLDOWN_SECS", &mut config.breaker.cooldown_secs);
    env_parse(
        "FINPOOL_REQUEST_TIMEOUT_SECS",
        &mut config.http.request_timeout_secs,
    );
    env_parse("FINPOOL_IDLE_TTL_SECS", &mut config.pool.idle_ttl_secs);
    env_parse("FINPOOL_MAX_BATCH_SIZE", &mut config.batch.max_batch_size);
    env_parse("FINPOOL_MAX_CONCURRENT", &mut config.batch.max_concurrent);
    env_parse("FINPOOL_BATCH_STRATEGY", &mut config.batch.strategy);
    env_parse("FINPOOL_CHUNK_SIZE", &mut config.stream.chunk_size);

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<CoreConfig> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
rate_limit:
  capacity: 20
  refill_per_sec: 5.0

retry:
  max_attempts: 3
  base_delay_ms: 100
  max_delay_ms: 2000
  retryable_statuses: [429, 503]

breaker:
  failure_threshold: 3
  cooldown_secs: 10
  count_transient_failures: true

http:
  request_timeout_secs: 5
  default_headers:
    X-Api-Key: secret-token

batch:
  max_batch_size: 25
  max_concurrent: 8
  strategy: fixed
  batch_timeout_secs: 120
"#;

        let config: CoreConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.rate_limit.capacity, 20);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.retryable_statuses, vec![429, 503]);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert!(config.breaker.count_transient_failures);
        assert_eq!(
            config.http.default_headers.get("X-Api-Key").unwrap(),
            "secret-token"
        );
        assert_eq!(config.batch.max_batch_size, 25);
        assert_eq!(config.batch.strategy, "fixed");
        assert_eq!(config.batch.batch_timeout_secs, Some(120));

        // Unspecified sections keep their defaults.
        assert_eq!(config.pool.idle_ttl_secs, 300);
        assert_eq!(config.stream.chunk_size, 1000);
    }

    #[test]
    fn test_default_values() {
        let config: CoreConfig = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.rate_limit.capacity, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.retryable_statuses, vec![429, 500, 502, 503, 504]);
        assert_eq!(config.breaker.cooldown_secs, 30);
        assert!(!config.breaker.count_transient_failures);
        assert_eq!(config.batch.strategy, "adaptive");
        assert_eq!(config.stream.buffer_size, 8192);
    }

    #[test]
    fn test_client_config_conversion() {
        let yaml = r#"
retry:
  max_attempts: 2
  base_delay_ms: 50
http:
  request_timeout_secs: 7
  default_headers:
    X-Api-Key: abc
"#;
        let config: CoreConfig = serde_yaml::from_str(yaml).unwrap();
        let client = config.client_config();

        assert_eq!(client.retry.max_attempts, 2);
        assert_eq!(client.retry.base_delay, Duration::from_millis(50));
        assert_eq!(client.request_timeout, Duration::from_secs(7));
        assert!(client
            .default_headers
            .iter()
            .any(|(name, value)| name == "X-Api-Key" && value == "abc"));
    }

    #[test]
    fn test_batcher_config_conversion() {
        let config = CoreConfig::default();
        let batcher = config.batcher_config();
        assert_eq!(batcher.strategy, BatchStrategy::Adaptive);
        assert_eq!(batcher.max_batch_size, 10);
        assert!(batcher.batch_timeout.is_none());
    }

    #[test]
    fn test_invalid_status_codes_are_dropped() {
        let yaml = r#"
retry:
  retryable_statuses: [429, 99, 1000]
"#;
        let config: CoreConfig = serde_yaml::from_str(yaml).unwrap();
        let client = config.client_config();
        assert_eq!(
            client.retry.retryable_statuses,
            vec![hyper::StatusCode::TOO_MANY_REQUESTS]
        );
    }
}
