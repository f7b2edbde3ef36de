//! TTL-bounded in-memory response cache.

pub mod key;

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A concurrent key-value store where every entry expires `ttl` after
/// insertion.
///
/// Expiry is checked lazily on read; physical removal happens only in the
/// background sweeper or through a later overwrite. Reads proceed
/// concurrently, while inserts, removals, and sweeps take the lock
/// exclusively.
#[derive(Debug)]
pub struct TtlCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns the value for `key` if present and not expired.
    ///
    /// An expired entry reads as absent but stays in the map until the
    /// sweeper or an overwrite removes it.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if Instant::now() > entry.expires_at {
            debug!(key, "cache entry expired");
            return None;
        }
        Some(entry.value.clone())
    }

    /// Stores `value` under `key` with a fresh lifetime, replacing any
    /// previous entry.
    pub fn insert(&self, key: String, value: Bytes) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, entry);
        }
    }

    /// Removes `key` if present; no-op otherwise.
    pub fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    /// Snapshot of all keys, including entries that have expired but have
    /// not been swept yet. Callers must treat the result as approximate.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Entry count on the same terms as [`keys`](Self::keys).
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Removes every expired entry in one full scan.
    fn purge_expired(&self) {
        let now = Instant::now();
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|key, entry| {
                let keep = entry.expires_at >= now;
                if !keep {
                    debug!(key, "removing expired cache entry");
                }
                keep
            });
        }
    }

    /// Periodically purges expired entries until `shutdown` is cancelled.
    ///
    /// Fires every `ttl / 2`, so no expired entry survives more than two
    /// ticks past its expiry.
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        // interval() panics on a zero period.
        let period = (self.ttl / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; skip it so the first sweep
        // happens after a full period.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.purge_expired(),
                _ = shutdown.cancelled() => {
                    debug!("cache sweeper stopped");
                    return;
                }
            }
        }
    }
}
