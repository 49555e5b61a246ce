//! Bounded memo of text to embedding lookups.
//!
//! Entries are evicted least-recently-used once `max_entries` is exceeded
//! and are ignored (and dropped) once older than `max_age`. Bounds are fixed
//! when the cache is built.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use quarry_core::config::CacheConfig;

struct CachedVector {
    vector: Vec<f32>,
    inserted_at: Instant,
}

/// LRU + max-age cache of embedding vectors keyed by normalised text.
pub struct EmbeddingCache {
    entries: Mutex<LruCache<String, CachedVector>>,
    max_entries: NonZeroUsize,
    max_age: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(config: &CacheConfig) -> Self {
        let max_entries = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self::with_bounds(max_entries, Duration::from_secs(config.max_age_secs))
    }

    pub fn with_bounds(max_entries: NonZeroUsize, max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(max_entries)),
            max_entries,
            max_age,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for `text`: trimmed, with whitespace runs collapsed to one space.
    pub fn normalize_key(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Look up the vector cached for `text`, if present and not expired.
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = Self::normalize_key(text);
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };

        let expired = match entries.get(&key) {
            Some(cached) if cached.inserted_at.elapsed() <= self.max_age => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(cached.vector.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(&key);
            debug!(key_len = key.len(), "Evicted expired cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `vector` for `text`, evicting the least recently used entry if full.
    pub fn set(&self, text: &str, vector: Vec<f32>) {
        let key = Self::normalize_key(text);
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                key,
                CachedVector {
                    vector,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries.get()
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .field("max_age", &self.max_age)
            .finish()
    }
}
