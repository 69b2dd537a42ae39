//! Request batching: fan a list of logical requests out across pooled
//! clients under a concurrency cap and collect results in submission order.
//!
//! Two strategies:
//! - Fixed: windows of `max_batch_size`, each drained with up to
//!   `max_concurrent` requests in flight before the next window starts.
//! - Adaptive: AIMD concurrency between windows. Additive increase (+1)
//!   after a window with zero failures and non-rising mean latency,
//!   multiplicative decrease (halve) on any failure, clamped to
//!   [1, max_concurrent]. The exact heuristic is a policy choice, not a
//!   contract.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::http::client::Fetched;
use crate::http::{FetchError, Origin, Response};
use crate::pool::ConnectionPool;

/// Batcher construction errors. `submit` itself never fails; per-request
/// failures are captured in the returned items.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid batcher config: {0}")]
    InvalidConfig(String),
}

/// How windows are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    Fixed,
    Adaptive,
}

/// Configuration for one batcher.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Requests per window.
    pub max_batch_size: usize,

    /// Concurrency cap within a window.
    pub max_concurrent: usize,

    pub strategy: BatchStrategy,

    /// Overall deadline; requests unresolved at the deadline are recorded as
    /// timed out without blocking on them further.
    pub batch_timeout: Option<Duration>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_concurrent: 3,
            strategy: BatchStrategy::Adaptive,
            batch_timeout: None,
        }
    }
}

/// One logical request destined for a pooled client.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub origin: Origin,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl BatchRequest {
    pub fn new(origin: Origin, path: impl Into<String>) -> Self {
        Self {
            origin,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Outcome of one batched request, at the same index as its request.
#[derive(Debug)]
pub struct BatchItem {
    pub index: usize,
    pub outcome: Result<Response, FetchError>,
    pub duration: Duration,
    /// Attempts the client performed, successful or not; 0 when the request
    /// was rejected before any network attempt.
    pub attempts: u32,
}

impl BatchItem {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Partition of a batch's items by success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn of(items: &[BatchItem]) -> Self {
        let successful = items.iter().filter(|i| i.is_success()).count();
        Self {
            total: items.len(),
            successful,
            failed: items.len() - successful,
        }
    }
}

/// Running statistics across submissions.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub avg_request_time: Duration,
    pub requests_per_second: f64,
}

/// Orchestrates concurrency-bounded waves of requests.
pub struct RequestBatcher {
    config: BatcherConfig,
    stats: Mutex<BatchStats>,
}

impl RequestBatcher {
    pub fn new(config: BatcherConfig) -> Result<Self, BatchError> {
        if config.max_batch_size == 0 {
            return Err(BatchError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if config.max_concurrent == 0 {
            return Err(BatchError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            stats: Mutex::new(BatchStats::default()),
        })
    }

    /// Submit requests through the shared connection pool.
    pub async fn submit(
        &self,
        pool: &Arc<ConnectionPool>,
        requests: Vec<BatchRequest>,
    ) -> Vec<BatchItem> {
        let pool = Arc::clone(pool);
        self.submit_with(requests, move |request| {
            let pool = Arc::clone(&pool);
            async move {
                let client = pool.client(&request.origin).await?;
                client
                    .execute(&request.path, &request.query, &request.headers)
                    .await
            }
        })
        .await
    }

    /// Submit requests through a caller-supplied executor. This is also the
    /// seam used by tests to batch without a live upstream.
    ///
    /// The returned vector has the same length and index order as the input,
    /// independent of completion order. A single request's failure never
    /// aborts the batch.
    pub async fn submit_with<F, Fut>(&self, requests: Vec<BatchRequest>, run: F) -> Vec<BatchItem>
    where
        F: Fn(BatchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fetched, FetchError>> + Send + 'static,
    {
        let total = requests.len();
        if total == 0 {
            return Vec::new();
        }

        let run = Arc::new(run);
        let started = Instant::now();
        let deadline = self.config.batch_timeout.map(|t| started + t);

        let mut concurrency = match self.config.strategy {
            BatchStrategy::Fixed => self.config.max_concurrent,
            BatchStrategy::Adaptive => self.config.max_concurrent.min(2),
        };
        let mut prev_mean_latency: Option<Duration> = None;

        info!(
            requests = total,
            strategy = ?self.config.strategy,
            max_batch_size = self.config.max_batch_size,
            max_concurrent = self.config.max_concurrent,
            "batch start"
        );

        let mut pending: VecDeque<(usize, BatchRequest)> =
            requests.into_iter().enumerate().collect();
        let mut results: Vec<Option<BatchItem>> = std::iter::repeat_with(|| None)
            .take(total)
            .collect();

        while !pending.is_empty() {
            let window: Vec<(usize, BatchRequest)> = {
                let take = self.config.max_batch_size.min(pending.len());
                pending.drain(..take).collect()
            };

            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut handles = Vec::with_capacity(window.len());
            for (index, request) in window {
                let run = Arc::clone(&run);
                let semaphore = Arc::clone(&semaphore);
                let origin = request.origin.clone();
                let handle = tokio::spawn(async move {
                    // The semaphore is never closed while tasks run.
                    let _permit = semaphore.acquire_owned().await;
                    let attempt_started = Instant::now();
                    match run(request).await {
                        Ok(fetched) => BatchItem {
                            index,
                            outcome: Ok(fetched.response),
                            duration: attempt_started.elapsed(),
                            attempts: fetched.attempts,
                        },
                        Err(error) => BatchItem {
                            index,
                            attempts: error.attempts(),
                            outcome: Err(error),
                            duration: attempt_started.elapsed(),
                        },
                    }
                });
                handles.push((index, origin, handle));
            }

            // Drain the window before starting the next one.
            let mut window_failures = 0usize;
            let mut window_latency = Duration::ZERO;
            let mut window_completed = 0usize;
            for (index, origin, mut handle) in handles {
                let item = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        match tokio::time::timeout(remaining, &mut handle).await {
                            Ok(joined) => Self::joined_item(index, joined),
                            Err(_) => {
                                handle.abort();
                                warn!(index = index, origin = %origin, "batch deadline hit, abandoning request");
                                BatchItem {
                                    index,
                                    outcome: Err(FetchError::Timeout {
                                        origin,
                                        attempt: 0,
                                        limit: self.config.batch_timeout.unwrap_or_default(),
                                    }),
                                    duration: started.elapsed(),
                                    attempts: 0,
                                }
                            }
                        }
                    }
                    None => Self::joined_item(index, handle.await),
                };

                if item.is_success() {
                    window_latency += item.duration;
                    window_completed += 1;
                } else {
                    window_failures += 1;
                }
                results[index] = Some(item);
            }

            if self.config.strategy == BatchStrategy::Adaptive && !pending.is_empty() {
                concurrency = self.adjust_concurrency(
                    concurrency,
                    window_failures,
                    window_completed,
                    window_latency,
                    &mut prev_mean_latency,
                );
            }
        }

        let items: Vec<BatchItem> = results
            .into_iter()
            .map(|item| item.expect("every index resolved exactly once"))
            .collect();

        let elapsed = started.elapsed();
        let summary = BatchSummary::of(&items);
        info!(
            requests = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            duration_ms = elapsed.as_millis() as u64,
            "batch complete"
        );
        self.record_stats(&summary, elapsed);
        items
    }

    fn joined_item(
        index: usize,
        joined: Result<BatchItem, tokio::task::JoinError>,
    ) -> BatchItem {
        match joined {
            Ok(item) => item,
            Err(e) => BatchItem {
                index,
                outcome: Err(FetchError::InvalidRequest(format!(
                    "batch task panicked: {e}"
                ))),
                duration: Duration::ZERO,
                attempts: 0,
            },
        }
    }

    /// AIMD between windows: +1 on a clean window with non-rising latency,
    /// halve on any failure.
    fn adjust_concurrency(
        &self,
        current: usize,
        failures: usize,
        completed: usize,
        latency_sum: Duration,
        prev_mean: &mut Option<Duration>,
    ) -> usize {
        let next = if failures > 0 {
            (current / 2).max(1)
        } else {
            let mean = if completed > 0 {
                latency_sum / completed as u32
            } else {
                Duration::ZERO
            };
            let rising = prev_mean.map(|prev| mean > prev).unwrap_or(false);
            *prev_mean = Some(mean);
            if rising {
                current
            } else {
                (current + 1).min(self.config.max_concurrent)
            }
        };
        if next != current {
            debug!(
                from = current,
                to = next,
                failures = failures,
                "adaptive concurrency adjusted"
            );
        }
        next
    }

    fn record_stats(&self, summary: &BatchSummary, elapsed: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_requests += summary.total as u64;
        stats.successful_requests += summary.successful as u64;
        stats.failed_requests += summary.failed as u64;
        stats.total_duration += elapsed;
        if summary.total > 0 {
            stats.avg_request_time = elapsed / summary.total as u32;
            let secs = elapsed.as_secs_f64();
            stats.requests_per_second = if secs > 0.0 {
                summary.total as f64 / secs
            } else {
                0.0
            };
        }
    }

    pub fn stats(&self) -> BatchStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = BatchStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hyper::header::HeaderMap;
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn origin() -> Origin {
        "https://data.example.com".parse().unwrap()
    }

    fn requests(n: usize) -> Vec<BatchRequest> {
        (0..n)
            .map(|i| BatchRequest::new(origin(), format!("/api/item/{i}")))
            .collect()
    }

    fn ok_response(marker: usize) -> Fetched {
        Fetched {
            response: Response {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from(marker.to_string()),
            },
            attempts: 1,
        }
    }

    fn batcher(config: BatcherConfig) -> RequestBatcher {
        RequestBatcher::new(config).unwrap()
    }

    #[test]
    fn test_rejects_malformed_config() {
        assert!(RequestBatcher::new(BatcherConfig {
            max_concurrent: 0,
            ..Default::default()
        })
        .is_err());
        assert!(RequestBatcher::new(BatcherConfig {
            max_batch_size: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_output() {
        let batcher = batcher(BatcherConfig::default());
        let items = batcher
            .submit_with(Vec::new(), |_| async { Ok(ok_response(0)) })
            .await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_order_preserved_with_slow_item() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 10,
            max_concurrent: 10,
            strategy: BatchStrategy::Fixed,
            batch_timeout: None,
        });

        // Request #7 (index 6) is deliberately the slowest.
        let items = batcher
            .submit_with(requests(10), |request| async move {
                let idx: usize = request
                    .path
                    .rsplit('/')
                    .next()
                    .unwrap()
                    .parse()
                    .unwrap();
                let delay = if idx == 6 { 80 } else { 5 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(ok_response(idx))
            })
            .await;

        assert_eq!(items.len(), 10);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.index, i);
            let body = item.outcome.as_ref().unwrap().body.clone();
            assert_eq!(body, Bytes::from(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_failures_are_captured_not_raised() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 4,
            max_concurrent: 2,
            strategy: BatchStrategy::Fixed,
            batch_timeout: None,
        });

        let items = batcher
            .submit_with(requests(8), |request| async move {
                let idx: usize = request.path.rsplit('/').next().unwrap().parse().unwrap();
                if idx % 3 == 0 {
                    Err(FetchError::HttpStatus {
                        origin: request.origin,
                        status: StatusCode::NOT_FOUND,
                    })
                } else {
                    Ok(ok_response(idx))
                }
            })
            .await;

        let summary = BatchSummary::of(&items);
        assert_eq!(summary.total, 8);
        // Indices 0, 3, 6 fail.
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.successful, 5);
        assert_eq!(summary.successful + summary.failed, summary.total);
        assert!(!items[3].is_success());
        assert!(items[4].is_success());
    }

    #[tokio::test]
    async fn test_failed_items_carry_attempt_counts() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 3,
            max_concurrent: 3,
            strategy: BatchStrategy::Fixed,
            batch_timeout: None,
        });

        let items = batcher
            .submit_with(requests(3), |request| async move {
                let idx: usize = request.path.rsplit('/').next().unwrap().parse().unwrap();
                match idx {
                    // Exhausted after a full retry schedule.
                    0 => Err(FetchError::RetryExhausted {
                        origin: request.origin.clone(),
                        attempts: 5,
                        last: Box::new(FetchError::HttpStatus {
                            origin: request.origin,
                            status: StatusCode::SERVICE_UNAVAILABLE,
                        }),
                    }),
                    // Rejected before any network attempt.
                    1 => Err(FetchError::CircuitOpen {
                        origin: request.origin,
                        retry_in: Duration::from_secs(30),
                    }),
                    // Terminal on the first attempt.
                    _ => Err(FetchError::HttpStatus {
                        origin: request.origin,
                        status: StatusCode::NOT_FOUND,
                    }),
                }
            })
            .await;

        assert_eq!(items[0].attempts, 5);
        assert_eq!(items[1].attempts, 0);
        assert_eq!(items[2].attempts, 1);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_cap() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 20,
            max_concurrent: 3,
            strategy: BatchStrategy::Fixed,
            batch_timeout: None,
        });

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let in_flight_ref = Arc::clone(&in_flight);
        let peak_ref = Arc::clone(&peak);

        batcher
            .submit_with(requests(20), move |_| {
                let in_flight = Arc::clone(&in_flight_ref);
                let peak = Arc::clone(&peak_ref);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(ok_response(0))
                }
            })
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_adaptive_completes_and_stays_bounded() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 5,
            max_concurrent: 4,
            strategy: BatchStrategy::Adaptive,
            batch_timeout: None,
        });

        let peak = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak_ref = Arc::clone(&peak);
        let in_flight_ref = Arc::clone(&in_flight);

        let items = batcher
            .submit_with(requests(25), move |_| {
                let peak = Arc::clone(&peak_ref);
                let in_flight = Arc::clone(&in_flight_ref);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(ok_response(0))
                }
            })
            .await;

        assert_eq!(items.len(), 25);
        assert!(items.iter().all(BatchItem::is_success));
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_batch_timeout_marks_unresolved_as_failed() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 4,
            max_concurrent: 4,
            strategy: BatchStrategy::Fixed,
            batch_timeout: Some(Duration::from_millis(50)),
        });

        let started = Instant::now();
        let items = batcher
            .submit_with(requests(4), |request| async move {
                let idx: usize = request.path.rsplit('/').next().unwrap().parse().unwrap();
                if idx >= 2 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(ok_response(idx))
            })
            .await;

        // The call must not block on the stuck requests.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(items.len(), 4);
        assert!(items[0].is_success());
        assert!(items[1].is_success());
        assert!(matches!(
            items[2].outcome,
            Err(FetchError::Timeout { .. })
        ));
        assert!(matches!(
            items[3].outcome,
            Err(FetchError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let batcher = batcher(BatcherConfig {
            max_batch_size: 5,
            max_concurrent: 5,
            strategy: BatchStrategy::Fixed,
            batch_timeout: None,
        });

        batcher
            .submit_with(requests(5), |_| async { Ok(ok_response(0)) })
            .await;
        batcher
            .submit_with(requests(5), |request| async move {
                Err(FetchError::HttpStatus {
                    origin: request.origin,
                    status: StatusCode::SERVICE_UNAVAILABLE,
                })
            })
            .await;

        let stats = batcher.stats();
        assert_eq!(stats.total_requests, 10);
        assert_eq!(stats.successful_requests, 5);
        assert_eq!(stats.failed_requests, 5);

        batcher.reset_stats();
        assert_eq!(batcher.stats().total_requests, 0);
    }
}
