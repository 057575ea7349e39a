//! Time-bounded dedup of command idempotency keys.
//!
//! Under at-least-once delivery the broker may hand the gateway the same
//! command twice; keys seen within the TTL are dropped. The cache is process
//! memory only; a restart forgets all in-flight dedup state, an accepted
//! tradeoff.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Recently-processed command keys with a fixed TTL and periodic sweep.
#[derive(Clone)]
pub struct IdempotencyCache {
    entries: Arc<RwLock<HashMap<String, Instant>>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Record `key` now. Returns `true` if the key was newly recorded,
    /// `false` if it was already present. Strict first-wins under
    /// concurrency, since the check and insert share one write lock.
    pub async fn mark(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Instant::now());
                true
            }
        }
    }

    pub async fn seen(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop entries older than the TTL.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, first_seen| now.duration_since(*first_seen) <= ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "idempotency sweep");
        }
    }

    /// Spawn the periodic sweep task. It only ever removes entries and never
    /// holds the lock across an await of anything but the map itself, so
    /// concurrent `mark`/`seen` calls are never blocked for long.
    pub fn spawn_sweeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick has nothing to sweep.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => cache.sweep().await,
                }
            }
        })
    }
}
