pub mod memory;
pub mod tier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

use crate::providers::ProviderResponse;

pub use memory::MemoryCache;
pub use tier::{CacheTier, MemoryTier, PostgresTier, RedisTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::L1 => "l1",
            CacheLevel::L2 => "l2",
            CacheLevel::L3 => "l3",
        }
    }
}

/// One cached completion, identical at every tier it lives in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,

    pub prompt_hash: String,
    pub response_hash: String,

    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,

    pub cost_usd: f64,
    pub model_used: String,
    pub provider_used: String,

    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub level: CacheLevel,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_entries: u64,
    pub eviction_count: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TierCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub errors: u64,
}

impl TierCounters {
    pub(crate) fn to_stats(&self, level: CacheLevel, total_entries: u64) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            level,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if lookups > 0 {
                self.hits as f64 / lookups as f64
            } else {
                0.0
            },
            total_entries,
            eviction_count: self.evictions,
            errors: self.errors,
        }
    }
}

/// Outcome of a tiered lookup.
#[derive(Debug, Clone, Serialize)]
pub struct CacheLookup {
    pub hit: bool,
    pub level: Option<CacheLevel>,
    pub entry: Option<CacheEntry>,
    pub lookup_time_ms: f64,
    pub levels_checked: u32,
}

/// Outcome of a fanout store.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStore {
    pub success: bool,
    pub levels_written: Vec<CacheLevel>,
    pub store_time_ms: f64,
    pub size_bytes: usize,
}

/// Stable cache key: md5 hex of the canonical prompt bytes. Not
/// security-sensitive; collision resistance is sufficient for this
/// workload. Sampling parameters are deliberately not part of the key.
pub fn cache_key(prompt: &str) -> String {
    format!("{:x}", md5::compute(prompt.as_bytes()))
}

/// Three-tier completion cache: lookups read T1 -> T2 -> T3 and promote
/// deep hits into every faster tier; stores fan out to all tiers and
/// succeed if any tier takes the write. Shared-tier failures degrade to
/// misses and are never user-visible.
pub struct CacheManager {
    l1: MemoryCache,
    l2: Arc<dyn CacheTier>,
    l3: Arc<dyn CacheTier>,
    l2_counters: Mutex<TierCounters>,
    l3_counters: Mutex<TierCounters>,
}

impl CacheManager {
    pub fn new(
        l1_capacity: usize,
        l1_ttl: std::time::Duration,
        l2: Arc<dyn CacheTier>,
        l3: Arc<dyn CacheTier>,
    ) -> Self {
        Self {
            l1: MemoryCache::new(l1_capacity, l1_ttl),
            l2,
            l3,
            l2_counters: Mutex::new(TierCounters::default()),
            l3_counters: Mutex::new(TierCounters::default()),
        }
    }

    pub async fn lookup(&self, prompt: &str) -> CacheLookup {
        let started = Instant::now();
        let key = cache_key(prompt);
        let mut levels_checked = 0;

        levels_checked += 1;
        if let Some(entry) = self.l1.get(&key) {
            return hit(CacheLevel::L1, entry, started, levels_checked);
        }

        levels_checked += 1;
        match self.l2.get(&key).await {
            Ok(Some(entry)) => {
                lock(&self.l2_counters).hits += 1;
                self.l1.put(&key, &entry);
                debug!(key = %key, from = "l2", "cache entry promoted");
                return hit(CacheLevel::L2, entry, started, levels_checked);
            }
            Ok(None) => lock(&self.l2_counters).misses += 1,
            Err(error) => {
                lock(&self.l2_counters).errors += 1;
                warn!(%error, "l2 cache lookup failed, treating as miss");
            }
        }

        levels_checked += 1;
        match self.l3.get(&key).await {
            Ok(Some(entry)) => {
                lock(&self.l3_counters).hits += 1;
                self.l1.put(&key, &entry);
                if let Err(error) = self.l2.put(&key, &entry).await {
                    lock(&self.l2_counters).errors += 1;
                    warn!(%error, "l2 promotion write failed");
                }
                debug!(key = %key, from = "l3", "cache entry promoted");
                return hit(CacheLevel::L3, entry, started, levels_checked);
            }
            Ok(None) => lock(&self.l3_counters).misses += 1,
            Err(error) => {
                lock(&self.l3_counters).errors += 1;
                warn!(%error, "l3 cache lookup failed, treating as miss");
            }
        }

        CacheLookup {
            hit: false,
            level: None,
            entry: None,
            lookup_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            levels_checked,
        }
    }

    pub async fn store(&self, prompt: &str, response: &ProviderResponse) -> CacheStore {
        let started = Instant::now();
        let key = cache_key(prompt);
        let entry = CacheEntry {
            key: key.clone(),
            value: response.content.clone(),
            prompt_hash: key.clone(),
            response_hash: cache_key(&response.content),
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            total_tokens: response.total_tokens,
            cost_usd: response.cost_usd,
            model_used: response.model_used.clone(),
            provider_used: response.provider_id.clone(),
            created_at: Utc::now(),
            expires_at: None,
            access_count: 0,
        };

        let mut levels_written = Vec::new();
        self.l1.put(&key, &entry);
        levels_written.push(CacheLevel::L1);

        match self.l2.put(&key, &entry).await {
            Ok(()) => levels_written.push(CacheLevel::L2),
            Err(error) => {
                lock(&self.l2_counters).errors += 1;
                warn!(%error, "l2 cache store failed");
            }
        }
        match self.l3.put(&key, &entry).await {
            Ok(()) => levels_written.push(CacheLevel::L3),
            Err(error) => {
                lock(&self.l3_counters).errors += 1;
                warn!(%error, "l3 cache store failed");
            }
        }

        CacheStore {
            success: !levels_written.is_empty(),
            levels_written,
            store_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            size_bytes: response.content.len(),
        }
    }

    pub async fn stats(&self) -> Vec<CacheStats> {
        let l2_entries = self.l2.entry_count().await.unwrap_or(0);
        let l3_entries = self.l3.entry_count().await.unwrap_or(0);
        vec![
            self.l1.stats(),
            lock(&self.l2_counters).to_stats(CacheLevel::L2, l2_entries),
            lock(&self.l3_counters).to_stats(CacheLevel::L3, l3_entries),
        ]
    }

    /// Hit rate across every tier's lookups.
    pub async fn overall_hit_rate(&self) -> f64 {
        let stats = self.stats().await;
        let hits: u64 = stats.iter().map(|s| s.hits).sum();
        let lookups: u64 = stats.iter().map(|s| s.hits + s.misses).sum();
        if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        }
    }

    pub async fn clear(&self) {
        self.l1.clear();
        if let Err(error) = self.l2.clear().await {
            warn!(%error, "l2 cache clear failed");
        }
        if let Err(error) = self.l3.clear().await {
            warn!(%error, "l3 cache clear failed");
        }
    }
}

fn hit(level: CacheLevel, entry: CacheEntry, started: Instant, levels_checked: u32) -> CacheLookup {
    CacheLookup {
        hit: true,
        level: Some(level),
        entry: Some(entry),
        lookup_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        levels_checked,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn manager() -> CacheManager {
        CacheManager::new(
            16,
            Duration::from_secs(300),
            Arc::new(MemoryTier::new(CacheLevel::L2, Duration::from_secs(3600))),
            Arc::new(MemoryTier::new(CacheLevel::L3, Duration::from_secs(86_400))),
        )
    }

    fn response(content: &str) -> ProviderResponse {
        ProviderResponse {
            content: content.to_string(),
            model_used: "gpt-3.5-turbo".to_string(),
            provider_id: "openai".to_string(),
            prompt_tokens: 5,
            completion_tokens: 7,
            total_tokens: 12,
            cost_usd: 0.004,
            cost_currency: "USD".to_string(),
            response_time_ms: 120.0,
            finish_reason: Some("stop".to_string()),
            success: true,
        }
    }

    #[tokio::test]
    async fn store_then_lookup_hits_l1() {
        let cache = manager();
        let store = cache.store("what is rust", &response("a language")).await;
        assert!(store.success);
        assert_eq!(store.levels_written.len(), 3);

        let lookup = cache.lookup("what is rust").await;
        assert!(lookup.hit);
        assert_eq!(lookup.level, Some(CacheLevel::L1));
        assert_eq!(lookup.levels_checked, 1);
        assert_eq!(lookup.entry.unwrap().value, "a language");
    }

    #[tokio::test]
    async fn deep_hit_promotes_to_faster_tiers() {
        let l2 = Arc::new(MemoryTier::new(CacheLevel::L2, Duration::from_secs(3600)));
        let l3 = Arc::new(MemoryTier::new(CacheLevel::L3, Duration::from_secs(86_400)));
        let cache = CacheManager::new(16, Duration::from_secs(300), l2.clone(), l3.clone());

        // Seed only T3, as if the entry outlived the faster tiers.
        let key = cache_key("seeded prompt");
        let entry = CacheEntry {
            key: key.clone(),
            value: "seeded".to_string(),
            prompt_hash: key.clone(),
            response_hash: cache_key("seeded"),
            prompt_tokens: 2,
            completion_tokens: 2,
            total_tokens: 4,
            cost_usd: 0.002,
            model_used: "claude-3-opus".to_string(),
            provider_used: "anthropic".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            access_count: 0,
        };
        l3.put(&key, &entry).await.unwrap();

        let lookup = cache.lookup("seeded prompt").await;
        assert!(lookup.hit);
        assert_eq!(lookup.level, Some(CacheLevel::L3));
        assert_eq!(lookup.levels_checked, 3);

        // The entry now lives in both faster tiers.
        assert!(l2.get(&key).await.unwrap().is_some());
        let again = cache.lookup("seeded prompt").await;
        assert_eq!(again.level, Some(CacheLevel::L1));
    }

    #[tokio::test]
    async fn miss_reports_all_levels_checked() {
        let cache = manager();
        let lookup = cache.lookup("never stored").await;
        assert!(!lookup.hit);
        assert_eq!(lookup.levels_checked, 3);
        assert!(lookup.entry.is_none());
    }

    #[tokio::test]
    async fn stored_entry_preserves_token_sum() {
        let cache = manager();
        cache.store("sum check", &response("abc")).await;
        let entry = cache.lookup("sum check").await.entry.unwrap();
        assert_eq!(entry.total_tokens, entry.prompt_tokens + entry.completion_tokens);
    }

    #[tokio::test]
    async fn clear_empties_every_tier() {
        let cache = manager();
        cache.store("p1", &response("r1")).await;
        cache.clear().await;
        let lookup = cache.lookup("p1").await;
        assert!(!lookup.hit);
    }

    #[tokio::test]
    async fn stats_cover_all_tiers() {
        let cache = manager();
        cache.store("p1", &response("r1")).await;
        cache.lookup("p1").await;
        cache.lookup("missing").await;

        let stats = cache.stats().await;
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].level, CacheLevel::L1);
        assert_eq!(stats[0].hits, 1);
        assert!(stats[1].misses >= 1);
        assert!(cache.overall_hit_rate().await > 0.0);
    }

    #[test]
    fn key_is_stable_md5_hex() {
        let key = cache_key("hello");
        assert_eq!(key.len(), 32);
        assert_eq!(key, cache_key("hello"));
        assert_ne!(key, cache_key("hello "));
    }
}
