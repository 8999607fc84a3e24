//! Shared action cache.
//!
//! One [`ActionCache`] is created by the job manager and handed to every
//! execution context it builds. Actions use it to memoise expensive lookups
//! (embedding calls, mapping API responses) across jobs. It is torn down when
//! the job manager shuts down.

use crate::config::CacheConfig;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct CacheEntry {
    value: serde_json::Value,
    created_at: Instant,
}

/// Hit/miss counters for an [`ActionCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups that returned a live entry.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries currently stored, expired ones included.
    pub entries: usize,
}

/// TTL cache keyed by hashed action inputs.
pub struct ActionCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ActionCache {
    /// Creates a cache from configuration.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: config.ttl(),
            enabled: config.enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates a cache that never stores anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            enabled: false,
            ttl_seconds: 1,
        })
    }

    /// Returns whether the cache stores entries.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Derives a stable key from a namespace and a JSON payload.
    ///
    /// Object keys are serialised in sorted order, so logically equal
    /// payloads produce the same key.
    #[must_use]
    pub fn key(namespace: &str, payload: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b":");
        hasher.update(payload.to_string().as_bytes());
        format!("{namespace}:{}", hex::encode(hasher.finalize()))
    }

    /// Returns a live entry.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        if !self.enabled {
            return None;
        }
        if let Some(entry) = self.entries.get(key) {
            if entry.created_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores an entry, replacing any previous value.
    pub fn insert(&self, key: impl Into<String>, value: serde_json::Value) {
        if !self.enabled {
            return;
        }
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Drops every entry and resets the counters.
    pub fn teardown(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Returns the current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl std::fmt::Debug for ActionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionCache")
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}
