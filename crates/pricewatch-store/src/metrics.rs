//! Demand metrics and tier assignment. Search counters accumulate in
//! memory and flush to SQLite in one transaction; tiers are recomputed
//! from cumulative percentile cutoffs over weekly search counts.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use pricewatch_core::config::TierCutoffs;
use pricewatch_core::model::ProductTier;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::StoreError;

/// In-memory search counters, flushed periodically by the scheduler.
/// Losing unflushed counts on crash only delays a tier promotion.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    counters: Mutex<HashMap<String, u64>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_search_count(&self, product_id: &str) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.entry(product_id.to_string()).or_insert(0) += 1;
    }

    /// Takes all pending counters, leaving the recorder empty.
    pub fn drain(&self) -> HashMap<String, u64> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *counters)
    }
}

/// Tier distribution after a recompute pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TierCounts {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
}

/// A product eligible for a scheduled refresh.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductRef {
    pub product_id: String,
    pub name: String,
    pub site: String,
}

#[derive(Debug, Clone)]
pub struct MetricsStore {
    pool: SqlitePool,
}

impl MetricsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Flush pending counters into `product_metrics` in one transaction.
    pub async fn flush(&self, recorder: &MetricsRecorder) -> Result<usize, StoreError> {
        let pending = recorder.drain();
        if pending.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (product_id, count) in &pending {
            sqlx::query(
                "INSERT INTO product_metrics (product_id, search_count_week, updated_at) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT(product_id) DO UPDATE SET \
                    search_count_week = search_count_week + excluded.search_count_week, \
                    updated_at = excluded.updated_at",
            )
            .bind(product_id)
            .bind(*count as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(flushed = pending.len(), "search counters flushed");
        Ok(pending.len())
    }

    /// Pin or unpin a product to the hot tier regardless of demand.
    pub async fn set_tracked(&self, product_id: &str, tracked: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO product_metrics (product_id, is_tracked, updated_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT(product_id) DO UPDATE SET \
                is_tracked = excluded.is_tracked, \
                updated_at = excluded.updated_at",
        )
        .bind(product_id)
        .bind(tracked)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a successful scrape time for a set of products.
    pub async fn mark_scraped_many(
        &self,
        product_ids: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if product_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for product_id in product_ids {
            sqlx::query(
                "INSERT INTO product_metrics (product_id, last_scraped_at, updated_at) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT(product_id) DO UPDATE SET \
                    last_scraped_at = excluded.last_scraped_at, \
                    updated_at = excluded.updated_at",
            )
            .bind(product_id)
            .bind(at)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Recompute tiers with cumulative cutoffs: the top `hot` fraction of
    /// products by weekly search count is HOT, the next slice up to the
    /// `warm` fraction is WARM, the rest COLD. Tracked products are always
    /// HOT and do not consume a percentile slot.
    pub async fn update_tiers(&self, cutoffs: &TierCutoffs) -> Result<TierCounts, StoreError> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT product_id, is_tracked FROM product_metrics \
             ORDER BY search_count_week DESC, last_scraped_at DESC, product_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let total = rows.len();
        let hot_n = (total as f64 * cutoffs.hot).round() as usize;
        let warm_n = (total as f64 * cutoffs.warm).round() as usize;

        let mut counts = TierCounts::default();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (rank, (product_id, is_tracked)) in rows.into_iter().enumerate() {
            let tier = if is_tracked || rank < hot_n {
                ProductTier::Hot
            } else if rank < warm_n {
                ProductTier::Warm
            } else {
                ProductTier::Cold
            };
            match tier {
                ProductTier::Hot => counts.hot += 1,
                ProductTier::Warm => counts.warm += 1,
                ProductTier::Cold => counts.cold += 1,
            }
            sqlx::query(
                "UPDATE product_metrics SET tier = $1, updated_at = $2 WHERE product_id = $3",
            )
            .bind(tier.as_str())
            .bind(now)
            .bind(&product_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(hot = counts.hot, warm = counts.warm, cold = counts.cold, "tiers recomputed");
        Ok(counts)
    }

    /// Products in a tier whose last scrape is older than the horizon (or
    /// never scraped), oldest first.
    pub async fn eligible_for_refresh(
        &self,
        tier: ProductTier,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ProductRef>, StoreError> {
        let refs = sqlx::query_as::<_, ProductRef>(
            "SELECT p.product_id, p.name, p.site \
             FROM product_metrics m \
             JOIN products p ON p.product_id = m.product_id \
             WHERE m.tier = $1 \
               AND (m.last_scraped_at IS NULL OR m.last_scraped_at < $2) \
             ORDER BY m.last_scraped_at ASC \
             LIMIT $3",
        )
        .bind(tier.as_str())
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(refs)
    }

    /// Weekly demand decay: zero the counters so a hot product must keep
    /// earning its tier.
    pub async fn reset_weekly_counts(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE product_metrics SET search_count_week = 0, updated_at = $1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::scratch_store;
    use crate::writer::PersistenceWriter;
    use pricewatch_core::model::{product_id, SellerInfo, ShippingInfo, ValidatedProduct};

    async fn seed_metrics(pool: &SqlitePool, product_id: &str, searches: i64) {
        sqlx::query(
            "INSERT INTO product_metrics (product_id, search_count_week, updated_at) \
             VALUES ($1, $2, $3)",
        )
        .bind(product_id)
        .bind(searches)
        .bind(Utc::now())
        .execute(pool)
        .await
        .expect("seed metrics");
    }

    fn product(slug: &str) -> ValidatedProduct {
        ValidatedProduct {
            product_id: product_id("noon.com", slug),
            site: "noon.com".to_string(),
            site_product_id: slug.to_string(),
            name: slug.to_uppercase(),
            price_amount: 100.0,
            price_currency: "SAR".to_string(),
            url: format!("https://noon.com/p/{slug}"),
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

    #[tokio::test]
    async fn flush_accumulates_counts_across_flushes() {
        let (_dir, store) = scratch_store().await;
        let metrics = MetricsStore::new(store.pool().clone());
        let recorder = MetricsRecorder::new();

        recorder.increment_search_count("abc");
        recorder.increment_search_count("abc");
        recorder.increment_search_count("def");
        assert_eq!(metrics.flush(&recorder).await.expect("flush"), 2);

        recorder.increment_search_count("abc");
        assert_eq!(metrics.flush(&recorder).await.expect("flush"), 1);
        assert_eq!(metrics.flush(&recorder).await.expect("empty flush"), 0);

        let (count,): (i64,) = sqlx::query_as(
            "SELECT search_count_week FROM product_metrics WHERE product_id = 'abc'",
        )
        .fetch_one(store.pool())
        .await
        .expect("row");
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn tiers_partition_by_cumulative_percentiles() {
        let (_dir, store) = scratch_store().await;
        let metrics = MetricsStore::new(store.pool().clone());
        // 1000 products where higher index means more weekly searches.
        for i in 0..1000 {
            seed_metrics(store.pool(), &format!("p{i:04}"), i).await;
        }

        let counts = metrics
            .update_tiers(&TierCutoffs::default())
            .await
            .expect("update tiers");
        assert_eq!(counts, TierCounts { hot: 10, warm: 190, cold: 800 });

        // The most-searched product is HOT, the least-searched COLD.
        let (top,): (String,) = sqlx::query_as(
            "SELECT tier FROM product_metrics WHERE product_id = 'p0999'",
        )
        .fetch_one(store.pool())
        .await
        .expect("top row");
        assert_eq!(top, "HOT");
        let (bottom,): (String,) = sqlx::query_as(
            "SELECT tier FROM product_metrics WHERE product_id = 'p0000'",
        )
        .fetch_one(store.pool())
        .await
        .expect("bottom row");
        assert_eq!(bottom, "COLD");
    }

    #[tokio::test]
    async fn tracked_products_are_pinned_hot() {
        let (_dir, store) = scratch_store().await;
        let metrics = MetricsStore::new(store.pool().clone());
        for i in 0..10 {
            seed_metrics(store.pool(), &format!("p{i}"), i).await;
        }
        // Least-searched product, pinned by a user.
        metrics.set_tracked("p0", true).await.expect("track");

        let counts = metrics
            .update_tiers(&TierCutoffs::default())
            .await
            .expect("update tiers");
        let (tier,): (String,) =
            sqlx::query_as("SELECT tier FROM product_metrics WHERE product_id = 'p0'")
                .fetch_one(store.pool())
                .await
                .expect("row");
        assert_eq!(tier, "HOT");
        assert!(counts.hot >= 1);
    }

    #[tokio::test]
    async fn eligibility_filters_by_tier_and_age() {
        let (_dir, store) = scratch_store().await;
        let metrics = MetricsStore::new(store.pool().clone());
        let writer = PersistenceWriter::new(store.pool().clone());

        let stale = product("stale-item");
        let recent = product("recent-item");
        let never = product("never-scraped");
        for p in [&stale, &recent, &never] {
            writer.upsert_one(p).await.expect("seed product");
        }

        let now = Utc::now();
        metrics
            .mark_scraped_many(&[stale.product_id.clone()], now - chrono::Duration::hours(3))
            .await
            .expect("mark stale");
        metrics
            .mark_scraped_many(&[recent.product_id.clone()], now)
            .await
            .expect("mark recent");
        sqlx::query(
            "INSERT INTO product_metrics (product_id, updated_at) VALUES ($1, $2)",
        )
        .bind(&never.product_id)
        .bind(now)
        .execute(store.pool())
        .await
        .expect("seed never-scraped");
        sqlx::query("UPDATE product_metrics SET tier = 'HOT'")
            .execute(store.pool())
            .await
            .expect("force hot");

        let eligible = metrics
            .eligible_for_refresh(ProductTier::Hot, now - chrono::Duration::hours(1), 50)
            .await
            .expect("eligible");
        let ids: Vec<&str> = eligible.iter().map(|r| r.product_id.as_str()).collect();
        assert!(ids.contains(&stale.product_id.as_str()));
        assert!(ids.contains(&never.product_id.as_str()));
        assert!(!ids.contains(&recent.product_id.as_str()));

        let none = metrics
            .eligible_for_refresh(ProductTier::Warm, now, 50)
            .await
            .expect("warm query");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn weekly_reset_zeroes_counters() {
        let (_dir, store) = scratch_store().await;
        let metrics = MetricsStore::new(store.pool().clone());
        seed_metrics(store.pool(), "abc", 42).await;

        assert_eq!(metrics.reset_weekly_counts().await.expect("reset"), 1);
        let (count,): (i64,) = sqlx::query_as(
            "SELECT search_count_week FROM product_metrics WHERE product_id = 'abc'",
        )
        .fetch_one(store.pool())
        .await
        .expect("row");
        assert_eq!(count, 0);
    }
}
