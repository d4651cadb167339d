use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// TTL + LRU response cache keyed by (input, context fingerprint).
///
/// Expiry is lazy: entries are dropped when looked up after their TTL or
/// when the cache is full and needs room.
pub struct ResponseCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    max_size: usize,
    enabled: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

struct CacheEntry {
    value: String,
    created_at: Instant,
    last_used: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub ttl_secs: u64,
}

/// Cache key: SHA-256 over the input and the fingerprint.
pub fn cache_key(input: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.update([0x1f]);
    hasher.update(fingerprint.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            max_size: max_size.max(1),
            enabled: true,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::ZERO, 1)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.created_at) < self.ttl
    }

    pub fn lookup(&self, input: &str, fingerprint: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let key = cache_key(input, fingerprint);
        let now = Instant::now();
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;

        let fresh = match state.entries.get(&key) {
            Some(entry) => self.is_fresh(entry, now),
            None => {
                state.misses += 1;
                return None;
            }
        };

        if !fresh {
            state.entries.remove(&key);
            state.misses += 1;
            debug!(key = %key, "Cache entry expired");
            return None;
        }

        state.hits += 1;
        let entry = state.entries.get_mut(&key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    pub fn store(&self, input: &str, fingerprint: &str, value: impl Into<String>) {
        if !self.enabled {
            return;
        }
        let key = cache_key(input, fingerprint);
        let now = Instant::now();
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;

        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_size {
            let ttl = self.ttl;
            state
                .entries
                .retain(|_, entry| now.duration_since(entry.created_at) < ttl);

            if state.entries.len() >= self.max_size {
                let lru = state
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone());
                if let Some(lru) = lru {
                    state.entries.remove(&lru);
                    debug!(key = %lru, "Evicted least recently used cache entry");
                }
            }
        }

        state.entries.insert(
            key,
            CacheEntry {
                value: value.into(),
                created_at: now,
                last_used: tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            enabled: self.enabled,
            size: state.entries.len(),
            max_size: self.max_size,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_depends_on_fingerprint() {
        assert_eq!(cache_key("hello", "0"), cache_key("hello", "0"));
        assert_ne!(cache_key("hello", "0"), cache_key("hello", "2"));
        // The separator keeps ("ab","c") and ("a","bc") apart
        assert_ne!(cache_key("ab", "c"), cache_key("a", "bc"));
        assert_eq!(cache_key("x", "y").len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = ResponseCache::new(Duration::from_secs(1), 10);
        cache.store("q", "0", "answer");
        assert_eq!(cache.lookup("q", "0").as_deref(), Some("answer"));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(cache.lookup("q", "0"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.store("a", "0", "A");
        cache.store("b", "0", "B");
        // Touch "a" so "b" becomes least recently used
        assert!(cache.lookup("a", "0").is_some());
        cache.store("c", "0", "C");

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("a", "0").is_some());
        assert!(cache.lookup("b", "0").is_none());
        assert!(cache.lookup("c", "0").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_purged_before_eviction() {
        let cache = ResponseCache::new(Duration::from_secs(10), 2);
        cache.store("old", "0", "stale");
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.store("fresh", "0", "new");
        // Touch "old" so plain LRU would pick "fresh" as the victim
        assert!(cache.lookup("old", "0").is_some());
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.store("third", "0", "x");

        assert!(cache.lookup("fresh", "0").is_some());
        assert!(cache.lookup("third", "0").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.store("a", "0", "1");
        cache.store("b", "0", "2");
        cache.store("a", "0", "3");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup("a", "0").as_deref(), Some("3"));
        assert_eq!(cache.lookup("b", "0").as_deref(), Some("2"));
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ResponseCache::disabled();
        cache.store("a", "0", "1");
        assert_eq!(cache.lookup("a", "0"), None);
        assert!(!cache.stats().enabled);
    }

    #[test]
    fn test_stats() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);
        cache.store("a", "0", "1");
        cache.lookup("a", "0");
        cache.lookup("missing", "0");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.size, 1);

        cache.clear();
        assert_eq!(cache.stats().hits, 0);
        assert!(cache.is_empty());
    }
}
