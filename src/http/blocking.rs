//! Thread-blocking client for synchronous callers.
//!
//! Wraps the async [`PooledClient`] on a dedicated current-thread runtime, so
//! retry, rate-limiting and circuit-breaker semantics are identical by
//! construction: one shared algorithm, two suspension schedulers. The calling
//! thread blocks at the same points the async variant suspends (network I/O,
//! limiter wait, backoff sleep).

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use super::client::{ClientConfig, Fetched, PooledClient};
use super::{FetchError, Origin, Response};

pub struct BlockingClient {
    inner: Arc<PooledClient>,
    runtime: Runtime,
}

impl BlockingClient {
    /// Build a standalone blocking client for one origin.
    pub fn new(origin: Origin, config: ClientConfig) -> Result<Self, FetchError> {
        let inner = Arc::new(PooledClient::new(origin, config)?);
        Self::from_shared(inner)
    }

    /// Wrap an existing shared client, e.g. one handed out by the connection
    /// pool, so synchronous and asynchronous callers hit the same limiter and
    /// breaker state.
    pub fn from_shared(inner: Arc<PooledClient>) -> Result<Self, FetchError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FetchError::Network {
                origin: inner.origin().clone(),
                detail: format!("failed to build blocking runtime: {e}"),
            })?;
        Ok(Self { inner, runtime })
    }

    pub fn origin(&self) -> &Origin {
        self.inner.origin()
    }

    pub fn execute(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<Fetched, FetchError> {
        self.runtime.block_on(self.inner.execute(path, query, headers))
    }

    pub fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<Response, FetchError> {
        self.runtime.block_on(self.inner.get(path, query, headers))
    }

    pub fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        self.runtime
            .block_on(self.inner.get_json(path, query, headers))
    }
}
