//! TTL-keyed lookup cache for cross-entity references.
//!
//! Workers consult the cache before hitting the staging store for folder
//! paths and destination ids. Entries expire `ttl` after insertion; a read
//! after expiry is a miss and the caller re-fetches. Changing the preset
//! only affects entries inserted afterwards.
//!
//! Time comes from [`tokio::time::Instant`], so tests can pause and
//! advance the clock.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CachePreset;
use crate::error::Result;

/// A cached value with its expiry window.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Expired once `now > inserted_at + ttl`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.inserted_at + self.ttl
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Concurrent TTL cache.
#[derive(Debug)]
pub struct CacheStore<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl_ms: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> CacheStore<V> {
    /// Create a cache whose default TTL comes from `preset`.
    pub fn new(preset: CachePreset) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl_ms: AtomicU64::new(duration_ms(preset.ttl())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Switch to a different preset. Existing entries keep their expiry.
    pub fn configure(&self, preset: CachePreset) {
        self.set_default_ttl(preset.ttl());
    }

    /// Set the TTL used by [`insert`](Self::insert).
    pub fn set_default_ttl(&self, ttl: Duration) {
        self.default_ttl_ms.store(duration_ms(ttl), Ordering::Relaxed);
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms.load(Ordering::Relaxed))
    }

    /// Look up a live entry.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let lookup = self.entries.get(key).map(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                Some(entry.value.clone())
            }
        });

        match lookup {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                // The shard guard from `get` is released; safe to remove.
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert with an explicit TTL.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Insert with the current default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.put(key, value, self.default_ttl());
    }

    /// Drop an entry, returning whether one was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Return the cached value or fetch, cache and return it.
    ///
    /// `None` from `fetch` (not found) is not cached.
    pub async fn get_or_try_insert_with<F, Fut>(&self, key: &str, fetch: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(Some(value));
        }

        let fetched = fetch().await?;
        if let Some(ref value) = fetched {
            self.insert(key, value.clone());
        }
        Ok(fetched)
    }

    /// Remove every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Cache purge removed {} expired entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
