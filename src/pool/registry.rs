//! Origin-keyed client registry.
//!
//! Lazily creates one [`PooledClient`] per origin, guarded so concurrent
//! first requests never create duplicates, and evicts entries that sit idle
//! past a TTL. Eviction only drops the registry's reference; in-flight
//! callers keep the client alive through their own `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::http::client::{ClientConfig, PooledClient};
use crate::http::{FetchError, Origin};

use super::circuit::CircuitState;

/// Configuration for registry eviction behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long an unused entry survives before eviction.
    pub idle_ttl: Duration,

    /// Interval between background eviction sweeps.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct PoolEntry {
    client: Arc<PooledClient>,
    created_at: Instant,
    last_used: Instant,
}

/// Per-origin observability snapshot.
#[derive(Debug, Clone)]
pub struct OriginStats {
    pub age: Duration,
    pub idle_for: Duration,
    pub circuit: CircuitState,
    /// Configured cap on idle keep-alive connections for this origin's
    /// transport. The transport pool inside hyper does not expose live
    /// per-connection counts, so the cap stands in for them.
    pub max_idle_per_host: usize,
}

/// Registry-wide statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub origin_count: usize,
    /// Total clients ever constructed, including TTL replacements.
    pub clients_created: u64,
    pub per_origin: HashMap<String, OriginStats>,
}

/// Process-wide registry mapping origin -> shared client.
pub struct ConnectionPool {
    entries: RwLock<HashMap<Origin, PoolEntry>>,
    config: PoolConfig,
    client_config: ClientConfig,
    clients_created: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, client_config: ClientConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            client_config,
            clients_created: AtomicU64::new(0),
        }
    }

    /// Get the shared client for an origin, creating it on first access.
    ///
    /// The whole check-and-create runs under the write lock, so concurrent
    /// first requests for the same origin observe exactly one construction.
    /// An entry idle past the TTL is replaced here rather than reused.
    pub async fn client(&self, origin: &Origin) -> Result<Arc<PooledClient>, FetchError> {
        {
            // Fast path: shared lock, reuse without touching last_used. The
            // slight TTL imprecision is acceptable; correctness of eviction
            // never depends on it because holders keep their own Arc.
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(origin) {
                if entry.last_used.elapsed() < self.config.idle_ttl {
                    return Ok(Arc::clone(&entry.client));
                }
            }
        }

        let mut entries = self.entries.write().await;
        // Re-check under the exclusive lock: another task may have created
        // or refreshed the entry while we waited.
        if let Some(entry) = entries.get_mut(origin) {
            if entry.last_used.elapsed() < self.config.idle_ttl {
                entry.last_used = Instant::now();
                return Ok(Arc::clone(&entry.client));
            }
            debug!(origin = %origin, "replacing idle-expired client");
            entries.remove(origin);
        }

        let client = Arc::new(PooledClient::new(
            origin.clone(),
            self.client_config.clone(),
        )?);
        self.clients_created.fetch_add(1, Ordering::Relaxed);
        info!(
            origin = %origin,
            total_created = self.clients_created.load(Ordering::Relaxed),
            "created pooled client"
        );

        let now = Instant::now();
        entries.insert(
            origin.clone(),
            PoolEntry {
                client: Arc::clone(&client),
                created_at: now,
                last_used: now,
            },
        );
        Ok(client)
    }

    /// Drop the registry entry for an origin. In-flight requests holding the
    /// client are unaffected.
    pub async fn evict(&self, origin: &Origin) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(origin).is_some();
        if removed {
            info!(origin = %origin, "evicted origin from pool");
        }
        removed
    }

    /// Remove every entry idle past the TTL. Returns how many were evicted.
    pub async fn sweep_idle(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.config.idle_ttl;
        entries.retain(|origin, entry| {
            let keep = entry.last_used.elapsed() < ttl;
            if !keep {
                debug!(origin = %origin, idle_secs = entry.last_used.elapsed().as_secs(), "sweeping idle client");
            }
            keep
        });
        before - entries.len()
    }

    /// Spawn the background eviction sweeper. Call once from a long-running
    /// process; short-lived callers can rely on lazy replacement instead.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let removed = pool.sweep_idle().await;
                if removed > 0 {
                    debug!(removed = removed, "pool sweep complete");
                }
            }
        })
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.read().await;
        let per_origin = entries
            .iter()
            .map(|(origin, entry)| {
                (
                    origin.to_string(),
                    OriginStats {
                        age: entry.created_at.elapsed(),
                        idle_for: entry.last_used.elapsed(),
                        circuit: entry.client.breaker().state(),
                        max_idle_per_host: entry.client.config().max_idle_per_host,
                    },
                )
            })
            .collect();
        PoolStats {
            origin_count: entries.len(),
            clients_created: self.clients_created.load(Ordering::Relaxed),
            per_origin,
        }
    }
}
