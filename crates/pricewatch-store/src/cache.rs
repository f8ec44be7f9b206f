//! Freshness cache: JSON envelopes keyed by normalized query, with a
//! freshness threshold strictly below the hard TTL so stale-but-unexpired
//! data can be served while a refresh runs.
//!
//! Read failures degrade to a miss rather than an error; the cache is a
//! derived, self-healing view, never the source of truth.

use std::time::Duration;

use chrono::{DateTime, Utc};
use pricewatch_core::model::{CacheEnvelope, CacheSource, ValidatedProduct};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
#[error("cache write failed for {key}: {reason}")]
pub struct CacheWriteError {
    pub key: String,
    pub reason: String,
}

/// A cache hit with its serving metadata.
#[derive(Debug, Clone)]
pub struct CachedSearch {
    pub data: Vec<ValidatedProduct>,
    pub source: CacheSource,
    pub fetched_at: DateTime<Utc>,
    pub is_stale: bool,
}

#[derive(Debug, Clone)]
pub struct FreshnessCache {
    pool: SqlitePool,
}

impl FreshnessCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Raw envelope lookup. Returns `None` on miss, expiry, or any backend
    /// failure so callers always have a safe fallback path.
    pub async fn get(&self, key: &str) -> Option<CacheEnvelope> {
        let row: Option<(String, DateTime<Utc>)> = match sqlx::query_as(
            "SELECT envelope, expires_at FROM search_cache WHERE cache_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row,
            Err(err) => {
                warn!(%key, %err, "cache read failed; treating as miss");
                return None;
            }
        };

        let (envelope_json, expires_at) = row?;
        if Utc::now() > expires_at {
            return None;
        }
        match serde_json::from_str(&envelope_json) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(%key, %err, "corrupt cache envelope; treating as miss");
                None
            }
        }
    }

    /// Lookup plus staleness computed against the caller's freshness
    /// threshold (strictly smaller than the entry's TTL).
    pub async fn get_with_metadata(&self, key: &str, freshness: Duration) -> Option<CachedSearch> {
        let envelope = self.get(key).await?;
        let age = Utc::now().signed_duration_since(envelope.fetched_at);
        let is_stale = age
            .to_std()
            .map(|age| age > freshness)
            .unwrap_or(false);
        Some(CachedSearch {
            data: envelope.data,
            source: envelope.source,
            fetched_at: envelope.fetched_at,
            is_stale,
        })
    }

    /// Atomic per-key overwrite with a fresh `fetched_at` and TTL.
    pub async fn set(
        &self,
        key: &str,
        data: &[ValidatedProduct],
        ttl: Duration,
        source: CacheSource,
    ) -> Result<(), CacheWriteError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        let envelope = CacheEnvelope {
            source,
            fetched_at: now,
            is_stale: false,
            data: data.to_vec(),
        };
        let envelope_json = serde_json::to_string(&envelope).map_err(|e| CacheWriteError {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        sqlx::query(
            "INSERT INTO search_cache (cache_key, envelope, fetched_at, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT(cache_key) DO UPDATE SET \
                envelope = excluded.envelope, \
                fetched_at = excluded.fetched_at, \
                expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(&envelope_json)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CacheWriteError {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Explicit invalidation. Returns whether an entry was removed;
    /// backend failures report `false`.
    pub async fn invalidate(&self, key: &str) -> bool {
        match sqlx::query("DELETE FROM search_cache WHERE cache_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
        {
            Ok(result) => result.rows_affected() > 0,
            Err(err) => {
                warn!(%key, %err, "cache invalidation failed");
                false
            }
        }
    }

    /// Drop entries past their hard TTL. Returns the number evicted.
    pub async fn evict_expired(&self) -> u64 {
        match sqlx::query("DELETE FROM search_cache WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await
        {
            Ok(result) => result.rows_affected(),
            Err(err) => {
                warn!(%err, "cache eviction failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::scratch_store;
    use pricewatch_core::model::{product_id, search_cache_key, SellerInfo, ShippingInfo};

    fn product(slug: &str, price: f64) -> ValidatedProduct {
        ValidatedProduct {
            product_id: product_id("noon.com", slug),
            site: "noon.com".to_string(),
            site_product_id: slug.to_string(),
            name: slug.to_uppercase(),
            price_amount: price,
            price_currency: "SAR".to_string(),
            url: format!("https://noon.com/item/{slug}"),
            image_url: None,
            seller: SellerInfo::default(),
            shipping: ShippingInfo::default(),
            fulfilled_by_retailer: false,
            currency_symbol: "ر.س".to_string(),
            vat_inclusive: true,
            is_valid: true,
            last_checked_at: Utc::now(),
        }
    }

    /// Rewrites an entry's fetched_at so staleness can be tested without
    /// sleeping through real thresholds.
    async fn backdate(pool: &SqlitePool, key: &str, minutes: i64) {
        let envelope_json: (String,) =
            sqlx::query_as("SELECT envelope FROM search_cache WHERE cache_key = $1")
                .bind(key)
                .fetch_one(pool)
                .await
                .expect("existing entry");
        let mut envelope: CacheEnvelope = serde_json::from_str(&envelope_json.0).expect("envelope");
        envelope.fetched_at = Utc::now() - chrono::Duration::minutes(minutes);
        sqlx::query("UPDATE search_cache SET envelope = $1, fetched_at = $2 WHERE cache_key = $3")
            .bind(serde_json::to_string(&envelope).expect("json"))
            .bind(envelope.fetched_at)
            .bind(key)
            .execute(pool)
            .await
            .expect("backdate");
    }

    #[tokio::test]
    async fn set_then_get_round_trips_envelope() {
        let (_dir, store) = scratch_store().await;
        let cache = FreshnessCache::new(store.pool().clone());
        let key = search_cache_key("iPhone 15");

        assert!(cache.get(&key).await.is_none());
        cache
            .set(&key, &[product("iphone-15", 3499.0)], Duration::from_secs(3600), CacheSource::Fresh)
            .await
            .expect("set");

        let envelope = cache.get(&key).await.expect("hit");
        assert_eq!(envelope.source, CacheSource::Fresh);
        assert!(!envelope.is_stale);
        assert_eq!(envelope.data.len(), 1);
        assert_eq!(envelope.data[0].name, "IPHONE-15");
    }

    #[tokio::test]
    async fn stale_entry_is_served_with_stale_flag_before_ttl() {
        let (_dir, store) = scratch_store().await;
        let cache = FreshnessCache::new(store.pool().clone());
        let key = search_cache_key("tv");
        cache
            .set(&key, &[product("tv-55", 1299.0)], Duration::from_secs(3600), CacheSource::Fresh)
            .await
            .expect("set");
        // 40 minutes old under a 30-minute freshness threshold, 60-minute TTL.
        backdate(store.pool(), &key, 40).await;

        let hit = cache
            .get_with_metadata(&key, Duration::from_secs(30 * 60))
            .await
            .expect("still within ttl");
        assert!(hit.is_stale);
        assert_eq!(hit.data.len(), 1);

        let fresh_hit = cache
            .get_with_metadata(&key, Duration::from_secs(45 * 60))
            .await
            .expect("hit");
        assert!(!fresh_hit.is_stale, "45-minute threshold keeps it fresh");
    }

    #[tokio::test]
    async fn expired_entries_are_misses_and_evictable() {
        let (_dir, store) = scratch_store().await;
        let cache = FreshnessCache::new(store.pool().clone());
        let key = search_cache_key("headphones");
        cache
            .set(&key, &[product("hp-1", 199.0)], Duration::from_secs(3600), CacheSource::Fresh)
            .await
            .expect("set");
        sqlx::query("UPDATE search_cache SET expires_at = $1 WHERE cache_key = $2")
            .bind(Utc::now() - chrono::Duration::minutes(1))
            .bind(&key)
            .execute(store.pool())
            .await
            .expect("force expiry");

        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.evict_expired().await, 1);
        assert_eq!(cache.evict_expired().await, 0);
    }

    #[tokio::test]
    async fn overwrite_and_invalidate() {
        let (_dir, store) = scratch_store().await;
        let cache = FreshnessCache::new(store.pool().clone());
        let key = search_cache_key("laptop");
        cache
            .set(&key, &[product("lp-1", 4999.0)], Duration::from_secs(60), CacheSource::Scraper)
            .await
            .expect("set");
        cache
            .set(&key, &[product("lp-1", 4899.0)], Duration::from_secs(60), CacheSource::Fresh)
            .await
            .expect("overwrite");

        let envelope = cache.get(&key).await.expect("hit");
        assert_eq!(envelope.source, CacheSource::Fresh);
        assert_eq!(envelope.data[0].price_amount, 4899.0);

        assert!(cache.invalidate(&key).await);
        assert!(!cache.invalidate(&key).await);
        assert!(cache.get(&key).await.is_none());
    }
}
