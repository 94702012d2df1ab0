use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::core::config::CatalogConfig;
use crate::observability::metrics as obs;

// ---------------------------------------------------------------------------
// Read-through TTL cache for catalog views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Small LRU of recently computed catalog views.
///
/// Entries expire after a fixed TTL; writers invalidate the affected keys so a
/// delete or a publish is visible immediately. A zero TTL or capacity disables
/// caching entirely.
pub struct TtlCache<V: Clone> {
    name: &'static str,
    cache: Option<Mutex<LruCache<String, CacheEntry<V>>>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: &'static str, ttl: Duration, capacity: usize) -> Self {
        let cache = match NonZeroUsize::new(capacity) {
            Some(cap) if !ttl.is_zero() => Some(Mutex::new(LruCache::new(cap))),
            _ => None,
        };
        Self { name, cache, ttl }
    }

    pub fn from_config(name: &'static str, config: &CatalogConfig) -> Self {
        Self::new(
            name,
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_capacity,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Fresh value for `key`, if any. Expired entries are dropped.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());

        let fresh = match cache.get(key) {
            Some(entry) if now.saturating_duration_since(entry.inserted_at) <= self.ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                cache.pop(key);
                trace!(cache = self.name, key, "cache entry expired");
                None
            }
            None => None,
        };

        obs::record_catalog_cache(self.name, fresh.is_some());
        fresh
    }

    pub fn insert(&self, key: &str, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    fn insert_at(&self, key: &str, value: V, inserted_at: Instant) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.put(key.to_string(), CacheEntry { value, inserted_at });
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.pop(key);
        }
    }

    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_then_invalidate() {
        let cache = TtlCache::new("test", Duration::from_secs(5), 4);
        cache.insert("a", 1u32);
        assert_eq!(cache.get("a"), Some(1));
        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = TtlCache::new("test", Duration::from_secs(5), 4);
        let start = Instant::now();
        cache.insert_at("a", 1u32, start);
        assert_eq!(cache.get_at("a", start + Duration::from_secs(5)), Some(1));
        assert_eq!(cache.get_at("a", start + Duration::from_secs(6)), None);
        // Dropped on the expired read.
        assert_eq!(cache.get_at("a", start), None);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TtlCache::new("test", Duration::from_secs(60), 2);
        cache.insert("a", 1u32);
        cache.insert("b", 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_zero_ttl_disables() {
        let cache = TtlCache::new("test", Duration::ZERO, 16);
        assert!(!cache.is_enabled());
        cache.insert("a", 1u32);
        assert_eq!(cache.get("a"), None);

        let no_capacity: TtlCache<u32> = TtlCache::new("test", Duration::from_secs(5), 0);
        assert!(!no_capacity.is_enabled());
    }

    #[test]
    fn test_clear() {
        let cache = TtlCache::new("test", Duration::from_secs(60), 4);
        cache.insert("a", 1u32);
        cache.insert("b", 2);
        cache.clear();
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), None);
    }
}
