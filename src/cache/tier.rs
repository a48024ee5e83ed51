use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{CacheEntry, CacheLevel};

/// A shared cache tier behind the manager (T2 and T3). Backends set their
/// own expiration on write; a failing backend is the manager's problem to
/// degrade, never the caller's.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn level(&self) -> CacheLevel;
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn entry_count(&self) -> Result<u64>;
}

/// In-process stand-in for a shared tier. Backs tests and deployments that
/// run without external cache stores.
pub struct MemoryTier {
    level: CacheLevel,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryTier {
    pub fn new(level: CacheLevel, ttl: Duration) -> Self {
        Self {
            level,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn deadline(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn level(&self) -> CacheLevel {
        self.level
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at.map(|e| e > now).unwrap_or(true) => {
                    return Ok(Some(entry.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let mut stamped = entry.clone();
        stamped.expires_at = Some(self.deadline());
        self.entries.write().await.insert(key.to_string(), stamped);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn entry_count(&self) -> Result<u64> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.expires_at.map(|x| x > now).unwrap_or(true))
            .count() as u64)
    }
}

/// The T2 shared cache server, addressed by connection URL.
pub struct RedisTier {
    manager: redis::aio::ConnectionManager,
    ttl_seconds: u64,
}

impl RedisTier {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("redis connection failed")?;
        Ok(Self {
            manager,
            ttl_seconds: ttl.as_secs().max(1),
        })
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn level(&self) -> CacheLevel {
        CacheLevel::L2
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(raw) => {
                let mut entry: CacheEntry =
                    serde_json::from_str(&raw).context("corrupt cache entry")?;
                entry.access_count += 1;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let mut stamped = entry.clone();
        stamped.expires_at =
            Some(Utc::now() + chrono::Duration::seconds(self.ttl_seconds as i64));
        let payload = serde_json::to_string(&stamped)?;
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, payload, self.ttl_seconds).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn entry_count(&self) -> Result<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(count)
    }
}

/// The T3 persistent store: one row per prompt hash, entry serialized as
/// JSON text, expiry enforced in the query.
pub struct PostgresTier {
    pool: PgPool,
    ttl: Duration,
}

impl PostgresTier {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .context("postgres connection failed")?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS gateway_cache (
                 cache_key TEXT PRIMARY KEY,
                 entry TEXT NOT NULL,
                 expires_at TIMESTAMPTZ NOT NULL
             )",
        )
        .execute(&pool)
        .await
        .context("cache table creation failed")?;
        Ok(Self { pool, ttl })
    }
}

#[async_trait]
impl CacheTier for PostgresTier {
    fn level(&self) -> CacheLevel {
        CacheLevel::L3
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT entry FROM gateway_cache WHERE cache_key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("entry")?;
                let mut entry: CacheEntry =
                    serde_json::from_str(&raw).context("corrupt cache entry")?;
                entry.access_count += 1;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let expires_at =
            Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut stamped = entry.clone();
        stamped.expires_at = Some(expires_at);
        let payload = serde_json::to_string(&stamped)?;
        sqlx::query(
            "INSERT INTO gateway_cache (cache_key, entry, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (cache_key)
             DO UPDATE SET entry = EXCLUDED.entry, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(payload)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM gateway_cache")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn entry_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM gateway_cache WHERE expires_at > NOW()")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            value: "cached".to_string(),
            prompt_hash: key.to_string(),
            response_hash: "r".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            cost_usd: 0.001,
            model_used: "m".to_string(),
            provider_used: "p".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            access_count: 0,
        }
    }

    #[tokio::test]
    async fn memory_tier_round_trip() {
        let tier = MemoryTier::new(CacheLevel::L2, Duration::from_secs(60));
        tier.put("k", &entry("k")).await.unwrap();
        let hit = tier.get("k").await.unwrap().unwrap();
        assert_eq!(hit.value, "cached");
        assert!(hit.expires_at.is_some());
        assert_eq!(tier.entry_count().await.unwrap(), 1);

        tier.clear().await.unwrap();
        assert!(tier.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_tier_expires_entries() {
        let tier = MemoryTier::new(CacheLevel::L3, Duration::from_secs(0));
        tier.put("k", &entry("k")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(tier.get("k").await.unwrap().is_none());
        assert_eq!(tier.entry_count().await.unwrap(), 0);
    }
}
