//! Atomic persistence: per-record transactions (product upsert plus a
//! price history row commit or roll back together) and batch writes where
//! one bad record never poisons its neighbors.

use std::time::Duration;

use chrono::Utc;
use pricewatch_core::model::{CacheSource, ValidatedProduct};
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::FreshnessCache;
use crate::db::StoreError;

// Batch writes run in concurrent slices of this size.
const SUB_BATCH: usize = 10;

/// A committed product row.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub product_id: String,
    pub db_id: i64,
}

/// Per-record result inside a batch report.
#[derive(Debug)]
pub enum RecordResult {
    Committed(UpsertOutcome),
    Failed { product_id: String, error: StoreError },
}

/// Outcome of a batch write. `success + failed` equals the input size.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub success: usize,
    pub failed: usize,
    pub results: Vec<RecordResult>,
}

impl BatchReport {
    pub fn committed_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| match r {
                RecordResult::Committed(outcome) => Some(outcome.product_id.clone()),
                RecordResult::Failed { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceWriter {
    pool: SqlitePool,
}

impl PersistenceWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert one product and append its price history row in a single
    /// transaction. Identity is `(site, site_product_id)`; `created_at`
    /// survives updates.
    pub async fn upsert_one(&self, product: &ValidatedProduct) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let (db_id,): (i64,) = sqlx::query_as(
            "INSERT INTO products (\
                product_id, site, site_product_id, name, price, currency, url, image_url, \
                seller_name, seller_rating, seller_rating_count, seller_type, source_sku, \
                shipping_info, fulfilled_by_retailer, currency_symbol, vat_inclusive, is_valid, \
                created_at, last_checked_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21) \
             ON CONFLICT(site, site_product_id) DO UPDATE SET \
                product_id = excluded.product_id, \
                name = excluded.name, \
                price = excluded.price, \
                currency = excluded.currency, \
                url = excluded.url, \
                image_url = excluded.image_url, \
                seller_name = excluded.seller_name, \
                seller_rating = excluded.seller_rating, \
                seller_rating_count = excluded.seller_rating_count, \
                seller_type = excluded.seller_type, \
                source_sku = excluded.source_sku, \
                shipping_info = excluded.shipping_info, \
                fulfilled_by_retailer = excluded.fulfilled_by_retailer, \
                currency_symbol = excluded.currency_symbol, \
                vat_inclusive = excluded.vat_inclusive, \
                is_valid = excluded.is_valid, \
                last_checked_at = excluded.last_checked_at, \
                updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(&product.product_id)
        .bind(&product.site)
        .bind(&product.site_product_id)
        .bind(&product.name)
        .bind(product.price_amount)
        .bind(&product.price_currency)
        .bind(&product.url)
        .bind(&product.image_url)
        .bind(&product.seller.name)
        .bind(product.seller.rating)
        .bind(product.seller.rating_count as i64)
        .bind(&product.seller.seller_type)
        .bind(&product.seller.sku)
        .bind(&product.shipping.raw)
        .bind(product.fulfilled_by_retailer)
        .bind(&product.currency_symbol)
        .bind(product.vat_inclusive)
        .bind(product.is_valid)
        .bind(now)
        .bind(product.last_checked_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO price_history (product_id, name, site, url, price, currency, source, scraped_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&product.product_id)
        .bind(&product.name)
        .bind(&product.site)
        .bind(&product.url)
        .bind(product.price_amount)
        .bind(&product.price_currency)
        .bind(&product.site)
        .bind(product.last_checked_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UpsertOutcome {
            product_id: product.product_id.clone(),
            db_id,
        })
    }

    /// Write a batch with per-record isolation: records run concurrently in
    /// sub-batches and each failure is recorded without aborting the rest.
    pub async fn upsert_batch(&self, products: Vec<ValidatedProduct>) -> BatchReport {
        let mut report = BatchReport::default();
        for chunk in products.chunks(SUB_BATCH) {
            let mut set = JoinSet::new();
            for product in chunk.iter().cloned() {
                let writer = self.clone();
                set.spawn(async move {
                    let product_id = product.product_id.clone();
                    match writer.upsert_one(&product).await {
                        Ok(outcome) => RecordResult::Committed(outcome),
                        Err(error) => RecordResult::Failed { product_id, error },
                    }
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(RecordResult::Committed(outcome)) => {
                        report.success += 1;
                        report.results.push(RecordResult::Committed(outcome));
                    }
                    Ok(RecordResult::Failed { product_id, error }) => {
                        warn!(%product_id, %error, "record rejected during batch write");
                        report.failed += 1;
                        report.results.push(RecordResult::Failed { product_id, error });
                    }
                    Err(join_err) => {
                        warn!(%join_err, "batch write task panicked");
                        report.failed += 1;
                    }
                }
            }
        }
        debug!(success = report.success, failed = report.failed, "batch write finished");
        report
    }

    /// Persist a merged result set, then refresh the cache entry. The
    /// database commit is the durability point: a cache write failure is
    /// logged and the next read self-heals from the store.
    pub async fn persist_and_refresh(
        &self,
        cache: &FreshnessCache,
        key: &str,
        products: Vec<ValidatedProduct>,
        ttl: Duration,
    ) -> BatchReport {
        let report = self.upsert_batch(products.clone()).await;
        if let Err(err) = cache.set(key, &products, ttl, CacheSource::Fresh).await {
            warn!(%err, "cache refresh failed after durable commit");
        }
        report
    }
}
