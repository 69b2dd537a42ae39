//! Async pooled client: one reusable transport per origin, wrapping the
//! origin's rate limiter and circuit breaker around a retrying request loop.
//!
//! Transport tuning:
//! - hyper-util legacy client with a keep-alive connection pool per host
//! - TCP_NODELAY for low latency
//! - native-tls (OpenSSL) for TLS

use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use tracing::{debug, info, warn};

use crate::pool::{
    Admission, CircuitBreaker, CircuitBreakerConfig, RateLimiterConfig, TokenBucket,
};

use super::{FetchError, Origin, Response, RetryPolicy};

/// Hex lookup table for percent-encoding query components.
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Per-client configuration: retry schedule, admission control and transport
/// tuning. The same config is shared by the async and blocking variants.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for each individual attempt, including body collection.
    pub request_timeout: Duration,

    pub retry: RetryPolicy,
    pub rate: RateLimiterConfig,
    pub breaker: CircuitBreakerConfig,

    /// Headers injected into every request (static auth, user agent, accept).
    pub default_headers: Vec<(String, String)>,

    /// Idle keep-alive connections retained per host.
    pub max_idle_per_host: usize,

    /// Idle timeout for pooled transport connections.
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            rate: RateLimiterConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            default_headers: vec![
                ("Accept".to_string(), "*/*".to_string()),
                ("Accept-Encoding".to_string(), "gzip, deflate".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
            ],
            max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Hands an unresolved half-open trial back to the breaker when the
/// admitted request is dropped mid-flight, e.g. by a caller-side timeout
/// or a batch abort. Resolved trials make the hand-back a no-op.
struct TrialGuard<'a> {
    breaker: Option<&'a CircuitBreaker>,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker {
            breaker.abandon_trial();
        }
    }
}

/// A successful fetch plus how hard the client had to work for it.
#[derive(Debug)]
pub struct Fetched {
    pub response: Response,
    /// Attempts performed, including the successful one.
    pub attempts: u32,
}

/// One reusable transport binding to an origin.
///
/// Shared by every caller targeting that origin; clone the surrounding `Arc`
/// rather than the client. Every request passes the rate limiter gate, is
/// rejected early by an open circuit breaker, and is otherwise attempted with
/// exponential backoff and jitter.
pub struct PooledClient {
    origin: Origin,
    transport: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
    config: ClientConfig,
}

impl PooledClient {
    pub fn new(origin: Origin, config: ClientConfig) -> Result<Self, FetchError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = TlsConnector::new().map_err(|e| FetchError::Network {
            origin: origin.clone(),
            detail: format!("failed to build TLS connector: {e}"),
        })?;
        let https = HttpsConnector::from((http, tls.into()));

        let transport = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        Ok(Self {
            limiter: TokenBucket::new(config.rate.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            origin,
            transport,
            config,
        })
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &TokenBucket {
        &self.limiter
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Execute a GET against this origin with retry, rate limiting and
    /// circuit breaking. Returns the response plus the attempt count.
    ///
    /// An open circuit fails immediately with `CircuitOpen`: no limiter
    /// consultation, no network attempt, no retry. The circuit breaker is
    /// reported the *terminal* outcome of the logical request; transient
    /// (retried) failures only count when the breaker is configured to
    /// count them.
    pub async fn execute(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<Fetched, FetchError> {
        let admission = match self.breaker.try_admit() {
            Ok(admission) => admission,
            Err(rejection) => {
                debug!(origin = %self.origin, "request rejected by circuit breaker");
                return Err(FetchError::CircuitOpen {
                    origin: self.origin.clone(),
                    retry_in: rejection.retry_in(),
                });
            }
        };
        // Dropped without a terminal outcome (cancellation), the guard
        // returns the trial so the breaker keeps probing recovery.
        let _trial = TrialGuard {
            breaker: (admission == Admission::Trial).then_some(&self.breaker),
        };

        let url = self.build_url(path, query);
        let start = Instant::now();
        let max_attempts = self.config.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.limiter.acquire(1).await;

            match self.attempt(&url, headers, attempt).await {
                Ok(response) => {
                    let status = response.status;
                    if status.is_success() {
                        self.breaker.record_success();
                        info!(
                            origin = %self.origin,
                            path = %path,
                            status = status.as_u16(),
                            attempts = attempt,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "fetch complete"
                        );
                        return Ok(Fetched { response, attempts: attempt });
                    }

                    let error = FetchError::HttpStatus {
                        origin: self.origin.clone(),
                        status,
                    };
                    if self.config.retry.is_retryable(status) {
                        if attempt < max_attempts {
                            self.breaker.record_transient_failure();
                            let mut delay = self.config.retry.backoff_delay(attempt);
                            // A throttling upstream names its own pace; honor
                            // it when it is longer than ours.
                            if status == StatusCode::TOO_MANY_REQUESTS {
                                if let Some(hint) = retry_after_hint(
                                    &response.headers,
                                    self.config.retry.max_delay,
                                ) {
                                    delay = delay.max(hint);
                                }
                            }
                            warn!(
                                origin = %self.origin,
                                status = status.as_u16(),
                                attempt = attempt,
                                backoff_ms = delay.as_millis() as u64,
                                "retryable status, backing off"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        self.breaker.record_failure();
                        return Err(self.exhausted(max_attempts, error));
                    }
                    // Non-retryable status is terminal on the spot.
                    self.breaker.record_failure();
                    return Err(error);
                }

                Err(error) => {
                    if error.is_transient() && attempt < max_attempts {
                        self.breaker.record_transient_failure();
                        let delay = self.config.retry.backoff_delay(attempt);
                        warn!(
                            origin = %self.origin,
                            attempt = attempt,
                            error = %error,
                            backoff_ms = delay.as_millis() as u64,
                            "attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.breaker.record_failure();
                    return Err(self.exhausted(attempt, error));
                }
            }
        }

        unreachable!("retry loop always returns")
    }

    /// GET returning the response on 2xx.
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<Response, FetchError> {
        Ok(self.execute(path, query, headers).await?.response)
    }

    /// GET expecting a JSON body. Upstreams under anti-bot pressure sometimes
    /// serve HTML with a 200, so the content type is validated before
    /// decoding.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let response = self.get(path, query, headers).await?;
        let content_type = response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("application/json") {
            return Err(FetchError::Parse {
                detail: format!("expected application/json, got {content_type:?}"),
            });
        }
        response.json()
    }

    /// One network attempt with the per-attempt deadline applied to the whole
    /// request, body collection included.
    async fn attempt(
        &self,
        url: &str,
        headers: &[(String, String)],
        attempt: u32,
    ) -> Result<Response, FetchError> {
        let request = self.build_request(url, headers)?;

        let round_trip = async {
            let response = self.transport.request(request).await.map_err(|e| {
                FetchError::Network {
                    origin: self.origin.clone(),
                    detail: e.to_string(),
                }
            })?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| FetchError::Network {
                    origin: self.origin.clone(),
                    detail: format!("body read failed: {e}"),
                })?
                .to_bytes();
            Ok(Response {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(self.config.request_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                origin: self.origin.clone(),
                attempt,
                limit: self.config.request_timeout,
            }),
        }
    }

    fn build_request(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Request<Full<Bytes>>, FetchError> {
        let mut builder = Request::builder().method(Method::GET).uri(url);
        for (name, value) in self.config.default_headers.iter().chain(headers) {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| {
                FetchError::InvalidRequest(format!("invalid header name {name:?}: {e}"))
            })?;
            let value = HeaderValue::try_from(value.as_str()).map_err(|e| {
                FetchError::InvalidRequest(format!("invalid header value: {e}"))
            })?;
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| FetchError::InvalidRequest(format!("request build error: {e}")))
    }

    fn build_url(&self, path: &str, query: &[(String, String)]) -> String {
        let mut url = self.origin.base_url();
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
        if !query.is_empty() {
            url.push('?');
            for (i, (key, value)) in query.iter().enumerate() {
                if i > 0 {
                    url.push('&');
                }
                encode_component(&mut url, key);
                url.push('=');
                encode_component(&mut url, value);
            }
        }
        url
    }

    fn exhausted(&self, attempts: u32, last: FetchError) -> FetchError {
        if attempts <= 1 {
            return last;
        }
        FetchError::RetryExhausted {
            origin: self.origin.clone(),
            attempts,
            last: Box::new(last),
        }
    }
}

/// Server-supplied pacing from a `Retry-After` header, delta-seconds form
/// only, capped at `cap`.
fn retry_after_hint(headers: &HeaderMap, cap: Duration) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs).min(cap))
}

/// Percent-encode a query component, RFC 3986 unreserved set.
fn encode_component(out: &mut String, raw: &str) {
    for &byte in raw.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push(HEX_UPPER[(byte >> 4) as usize] as char);
                out.push(HEX_UPPER[(byte & 0x0f) as usize] as char);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CircuitState;

    fn test_client() -> PooledClient {
        let origin: Origin = "https://data.example.com".parse().unwrap();
        PooledClient::new(origin, ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_build_url_encodes_query() {
        let client = test_client();
        let url = client.build_url(
            "/api/historical",
            &[
                ("symbol".to_string(), "M&M".to_string()),
                ("from".to_string(), "2024-01-01".to_string()),
            ],
        );
        assert_eq!(
            url,
            "https://data.example.com:443/api/historical?symbol=M%26M&from=2024-01-01"
        );
    }

    #[test]
    fn test_build_url_without_leading_slash() {
        let client = test_client();
        assert_eq!(
            client.build_url("api/quote", &[]),
            "https://data.example.com:443/api/quote"
        );
    }

    #[test]
    fn test_encode_component_unreserved_passthrough() {
        let mut out = String::new();
        encode_component(&mut out, "NIFTY_50-2024.csv~");
        assert_eq!(out, "NIFTY_50-2024.csv~");

        let mut out = String::new();
        encode_component(&mut out, "a b/c");
        assert_eq!(out, "a%20b%2Fc");
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_network() {
        let origin: Origin = "https://data.example.com".parse().unwrap();
        let config = ClientConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
                max_cooldown: Duration::from_secs(600),
                count_transient_failures: false,
            },
            ..Default::default()
        };
        let client = PooledClient::new(origin, config).unwrap();
        client.breaker().record_failure();
        assert_eq!(client.breaker().state(), CircuitState::Open);

        // Tokens are untouched because the breaker rejects before the limiter.
        let before = client.limiter().available();
        let result = client.execute("/api/quote", &[], &[]).await;
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
        assert!(client.limiter().available() >= before - 0.01);
    }

    #[test]
    fn test_retry_after_hint_parsed_and_capped() {
        let cap = Duration::from_secs(5);

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after_hint(&headers, cap), Some(Duration::from_secs(2)));

        // An upstream asking for more than the cap is clamped to it.
        headers.insert(RETRY_AFTER, HeaderValue::from_static("300"));
        assert_eq!(retry_after_hint(&headers, cap), Some(cap));

        // HTTP-date and garbage forms fall back to the computed backoff.
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after_hint(&headers, cap), None);

        assert_eq!(retry_after_hint(&HeaderMap::new(), cap), None);
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let client = test_client();
        let result = client.build_request(
            "https://data.example.com/api",
            &[("bad header name".to_string(), "x".to_string())],
        );
        assert!(matches!(result, Err(FetchError::InvalidRequest(_))));
    }
}
