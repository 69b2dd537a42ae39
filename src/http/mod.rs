//! Resilient HTTP layer: origin identity, response/error types and the
//! retrying clients (async + blocking) that every data accessor goes through.

pub mod blocking;
pub mod client;

pub use blocking::BlockingClient;
pub use client::{ClientConfig, Fetched, PooledClient};

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::{StatusCode, Uri};
use rand::Rng;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors surfaced by the fetch layer.
///
/// Transient network/timeout/status failures are retried internally and only
/// surface after exhaustion; `CircuitOpen` is never retried internally so the
/// caller can apply its own fallback immediately.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error talking to {origin}: {detail}")]
    Network { origin: Origin, detail: String },

    #[error("attempt {attempt} to {origin} exceeded {limit:?}")]
    Timeout {
        origin: Origin,
        attempt: u32,
        limit: Duration,
    },

    #[error("HTTP {status} from {origin}")]
    HttpStatus { origin: Origin, status: StatusCode },

    #[error("circuit open for {origin}, retry in {retry_in:?}")]
    CircuitOpen { origin: Origin, retry_in: Duration },

    #[error("all {attempts} attempts to {origin} failed: {last}")]
    RetryExhausted {
        origin: Origin,
        attempts: u32,
        last: Box<FetchError>,
    },

    #[error("failed to decode response body: {detail}")]
    Parse { detail: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::Timeout { .. }
        )
    }

    /// Attempts performed before this error became terminal. Zero when the
    /// request was rejected before any network attempt.
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::RetryExhausted { attempts, .. } => *attempts,
            FetchError::Timeout { attempt, .. } => *attempt,
            FetchError::CircuitOpen { .. } | FetchError::InvalidRequest(_) => 0,
            FetchError::Network { .. } | FetchError::HttpStatus { .. } | FetchError::Parse { .. } => 1,
        }
    }
}

/// Identity of one upstream service: scheme + host + port.
///
/// All per-origin state (rate limiter tokens, breaker counters, the pooled
/// transport) is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Origin {
    /// Base URL for building absolute request URIs.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    fn from_uri(uri: &Uri) -> Result<Self, FetchError> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| FetchError::InvalidRequest(format!("missing scheme in {uri}")))?
            .to_string();
        let host = uri
            .host()
            .ok_or_else(|| FetchError::InvalidRequest(format!("missing host in {uri}")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(match scheme.as_str() {
            "https" => 443,
            _ => 80,
        });
        Ok(Self { scheme, host, port })
    }
}

impl FromStr for Origin {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = s
            .parse::<Uri>()
            .map_err(|e| FetchError::InvalidRequest(format!("invalid origin {s}: {e}")))?;
        Origin::from_uri(&uri)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// A fully collected HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<&str, FetchError> {
        std::str::from_utf8(&self.body).map_err(|e| FetchError::Parse {
            detail: format!("body is not valid UTF-8: {e}"),
        })
    }

    /// Decode the body as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Parse {
            detail: format!("invalid JSON body: {e}"),
        })
    }
}

/// Retry schedule shared by both client variants.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per logical request (first try included).
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles each attempt after that.
    pub base_delay: Duration,

    /// Cap applied to the exponential delay, before jitter.
    pub max_delay: Duration,

    /// Jitter added per sleep, uniform in [0, base_delay * jitter_fraction).
    pub jitter_fraction: f64,

    /// Status codes worth another attempt.
    pub retryable_statuses: Vec<StatusCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter_fraction: 0.2,
            retryable_statuses: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Exponential delay for the sleep after `attempt` (1-based), capped at
    /// `max_delay`, before jitter.
    pub fn backoff_base(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX));
        exp.min(self.max_delay)
    }

    /// Full backoff delay including jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter_max = self.base_delay.as_secs_f64() * self.jitter_fraction;
        let jitter = if jitter_max > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter_max)
        } else {
            0.0
        };
        self.backoff_base(attempt) + Duration::from_secs_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_parse_defaults_port() {
        let origin: Origin = "https://data.example.com".parse().unwrap();
        assert_eq!(origin.scheme, "https");
        assert_eq!(origin.host, "data.example.com");
        assert_eq!(origin.port, 443);

        let origin: Origin = "http://localhost:9321".parse().unwrap();
        assert_eq!(origin.port, 9321);
        assert_eq!(origin.base_url(), "http://localhost:9321");
    }

    #[test]
    fn test_origin_identity() {
        let a: Origin = "https://data.example.com".parse().unwrap();
        let b: Origin = "https://data.example.com:443".parse().unwrap();
        let c: Origin = "http://data.example.com".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_origin_rejects_garbage() {
        assert!("not a url at all".parse::<Origin>().is_err());
        assert!("/just/a/path".parse::<Origin>().is_err());
    }

    #[test]
    fn test_backoff_monotonicity() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(policy.backoff_base(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_base(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_base(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_base(4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            ..Default::default()
        };
        assert_eq!(policy.backoff_base(3), Duration::from_millis(250));
        assert_eq!(policy.backoff_base(30), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_fraction: 0.2,
            ..Default::default()
        };
        for _ in 0..100 {
            let d = policy.backoff_delay(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(121));
        }
    }

    #[test]
    fn test_retryable_statuses() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(policy.is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!policy.is_retryable(StatusCode::NOT_FOUND));
        assert!(!policy.is_retryable(StatusCode::OK));
    }

    #[test]
    fn test_response_json() {
        let resp = Response {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"symbol\": \"SBIN\", \"close\": 812.4}"),
        };
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["symbol"], "SBIN");

        let bad = Response {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"<html>blocked</html>"),
        };
        assert!(matches!(
            bad.json::<serde_json::Value>(),
            Err(FetchError::Parse { .. })
        ));
    }
}
