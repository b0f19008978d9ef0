//! In-process cache for read-mostly GitHub responses.
//!
//! Entries live for a fixed TTL. They are dropped when read after expiry
//! and by the periodic sweep from [`spawn_purge_task`]. Only successful
//! responses are stored.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::client::ApiResponse;

#[derive(Debug, Clone)]
struct CacheEntry {
    stored_at: Instant,
    response: ApiResponse,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<ApiResponse> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            return Some(entry.response.clone());
        }
        drop(entry);
        self.entries.remove(key);
        None
    }

    pub fn insert(&self, key: String, response: ApiResponse) {
        self.entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                response,
            },
        );
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Spawn a background task that sweeps expired entries every `interval`.
pub fn spawn_purge_task(cache: Arc<ResponseCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let purged = cache.purge_expired();
            tracing::debug!(
                purged,
                remaining = cache.len(),
                "GitHub response cache sweep complete"
            );
        }
    })
}

/// Build the cache key for a request. Query parameters are sorted so the
/// key does not depend on the order callers pass them in.
pub fn cache_key(scope: &str, method: &str, path: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = params.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b" ");
    hasher.update(path.as_bytes());
    for (name, value) in sorted {
        hasher.update(b"&");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }

    format!("github.{}.{}", scope, hex::encode(hasher.finalize()))
}
