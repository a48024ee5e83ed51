use chrono::{Duration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use super::{CacheEntry, CacheLevel, CacheStats, TierCounters};

/// The in-process L1 tier: bounded LRU with a short per-entry TTL.
///
/// Everything here is synchronous and bounded; the lock is never held
/// across an await point.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    counters: Mutex<TierCounters>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(capacity: usize, ttl: std::time::Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            counters: Mutex::new(TierCounters::default()),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(5)),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = lock(&self.entries);
        let mut counters = lock(&self.counters);

        match entries.get_mut(key) {
            Some(entry) => {
                if entry
                    .expires_at
                    .map(|expires| expires <= Utc::now())
                    .unwrap_or(false)
                {
                    entries.pop(key);
                    counters.misses += 1;
                    return None;
                }
                entry.access_count += 1;
                counters.hits += 1;
                Some(entry.clone())
            }
            None => {
                counters.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: &str, entry: &CacheEntry) {
        let mut stamped = entry.clone();
        stamped.expires_at = Some(Utc::now() + self.ttl);

        let mut entries = lock(&self.entries);
        if let Some((evicted_key, _)) = entries.push(key.to_string(), stamped) {
            if evicted_key != key {
                lock(&self.counters).evictions += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn stats(&self) -> CacheStats {
        let counters = lock(&self.counters).clone();
        counters.to_stats(CacheLevel::L1, self.len() as u64)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::cache_key;

    fn entry(key: &str, value: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            value: value.to_string(),
            prompt_hash: key.to_string(),
            response_hash: cache_key(value),
            prompt_tokens: 4,
            completion_tokens: 6,
            total_tokens: 10,
            cost_usd: 0.01,
            model_used: "gpt-3.5-turbo".to_string(),
            provider_used: "openai".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            access_count: 0,
        }
    }

    #[test]
    fn get_after_put_returns_entry() {
        let cache = MemoryCache::new(4, std::time::Duration::from_secs(300));
        cache.put("k1", &entry("k1", "hello"));
        let hit = cache.get("k1").unwrap();
        assert_eq!(hit.value, "hello");
        assert_eq!(hit.access_count, 1);
    }

    #[test]
    fn lru_eviction_counts() {
        let cache = MemoryCache::new(2, std::time::Duration::from_secs(300));
        cache.put("a", &entry("a", "1"));
        cache.put("b", &entry("b", "2"));
        cache.put("c", &entry("c", "3"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().eviction_count, 1);
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let cache = MemoryCache::new(4, std::time::Duration::from_millis(0));
        cache.put("k1", &entry("k1", "hello"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn stats_track_hit_rate() {
        let cache = MemoryCache::new(4, std::time::Duration::from_secs(300));
        cache.put("k1", &entry("k1", "hello"));
        cache.get("k1");
        cache.get("nope");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
