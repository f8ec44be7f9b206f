//! Search front door: cache-first reads with stale-while-revalidate, and a
//! synchronous cold path when the cache has nothing to serve.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pricewatch_core::model::{
    search_cache_key, CacheSource, ProductTier, ScrapeJob, ValidatedProduct,
};
use pricewatch_pipeline::{merge_results, validate_records};
use tracing::{info, warn};

use crate::worker::{scrape_all, EngineContext};

/// What a search returns: the products plus where they came from and how
/// fresh they are.
#[derive(Debug)]
pub struct SearchResponse {
    pub products: Vec<ValidatedProduct>,
    pub source: CacheSource,
    pub is_stale: bool,
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SearchService {
    ctx: Arc<EngineContext>,
}

impl SearchService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Serve a search. Cache hits return immediately; a stale hit also
    /// enqueues one background refresh for the key. A miss falls through
    /// to the cold path, which scrapes inline and seeds the cache.
    pub async fn search(&self, query: &str) -> anyhow::Result<SearchResponse> {
        let ctx = &self.ctx;
        let key = search_cache_key(query);
        // Interactive searches are judged against the hot freshness window;
        // tier policies govern background refresh cadence, not serving.
        let freshness = ctx.config.tiers.hot.freshness;

        if let Some(hit) = ctx.cache.get_with_metadata(&key, freshness).await {
            for product in &hit.data {
                ctx.recorder.increment_search_count(&product.product_id);
            }
            if hit.is_stale && ctx.guard.try_begin(&key) {
                let job = ScrapeJob::delta_refresh(query, ProductTier::Hot);
                info!(%key, job_id = %job.id, "stale hit; enqueueing background refresh");
                if let Err(err) = ctx.queue.enqueue(job).await {
                    ctx.guard.end(&key);
                    warn!(%key, %err, "failed to enqueue refresh");
                }
            }
            return Ok(SearchResponse {
                products: hit.data,
                source: CacheSource::Cache,
                is_stale: hit.is_stale,
                fetched_at: Some(hit.fetched_at),
            });
        }

        self.cold_search(query, &key).await
    }

    /// Cache miss: fan out to every adapter inline, bounded by the cold
    /// path timeout, then persist and cache whatever validated. Storage
    /// failures degrade to serving the scraped set without durability.
    async fn cold_search(&self, query: &str, key: &str) -> anyhow::Result<SearchResponse> {
        let ctx = &self.ctx;
        let outcome = scrape_all(
            ctx,
            ctx.scrapers.all().to_vec(),
            query,
            ctx.config.workers.cold_path_timeout,
        )
        .await;
        if outcome.records.is_empty() && !outcome.failures.is_empty() {
            let reasons: Vec<String> = outcome.failures.iter().map(|f| f.to_string()).collect();
            anyhow::bail!("every adapter failed for {query:?}: {}", reasons.join("; "));
        }

        let validated = validate_records(outcome.records, &ctx.config.default_currency, Utc::now());
        let delta = merge_results(&[], &validated.valid, &ctx.config.merge);
        let now = Utc::now();

        let ttl = ctx.config.tiers.hot.ttl;
        let report = ctx
            .writer
            .persist_and_refresh(&ctx.cache, key, delta.merged.clone(), ttl)
            .await;
        if report.failed > 0 {
            warn!(
                %key,
                failed = report.failed,
                "some records were not persisted; serving scraped set anyway"
            );
        }
        for product in &delta.merged {
            ctx.recorder.increment_search_count(&product.product_id);
        }
        if let Err(err) = ctx.metrics.mark_scraped_many(&report.committed_ids(), now).await {
            warn!(%err, "failed to stamp scrape time");
        }

        Ok(SearchResponse {
            products: delta.merged,
            source: CacheSource::Fresh,
            is_stale: false,
            fetched_at: Some(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::{raw, test_context, StaticScraper};
    use pricewatch_adapters::ScraperRegistry;
    use pricewatch_core::model::CacheEnvelope;
    use sqlx::SqlitePool;
    use std::time::Duration;

    async fn backdate_cache(pool: &SqlitePool, key: &str, minutes: i64) {
        let (envelope_json,): (String,) =
            sqlx::query_as("SELECT envelope FROM search_cache WHERE cache_key = $1")
                .bind(key)
                .fetch_one(pool)
                .await
                .expect("entry");
        let mut envelope: CacheEnvelope = serde_json::from_str(&envelope_json).expect("envelope");
        envelope.fetched_at = Utc::now() - chrono::Duration::minutes(minutes);
        sqlx::query("UPDATE search_cache SET envelope = $1, fetched_at = $2 WHERE cache_key = $3")
            .bind(serde_json::to_string(&envelope).expect("json"))
            .bind(envelope.fetched_at)
            .bind(key)
            .execute(pool)
            .await
            .expect("backdate");
    }

    fn single_site_registry() -> ScraperRegistry {
        let mut registry = ScraperRegistry::new();
        registry.register(std::sync::Arc::new(StaticScraper {
            site: "noon.com",
            records: vec![raw("noon.com", "iphone-15", 3499.0)],
            delay: Duration::ZERO,
        }));
        registry
    }

    #[tokio::test]
    async fn cold_path_scrapes_and_seeds_the_cache() {
        let (_dir, ctx, _pool) = test_context(single_site_registry()).await;
        let service = SearchService::new(std::sync::Arc::clone(&ctx));

        let response = service.search("iPhone 15").await.expect("search");
        assert_eq!(response.source, CacheSource::Fresh);
        assert!(!response.is_stale);
        assert_eq!(response.products.len(), 1);

        // The second search is served from cache, no new scrape.
        let second = service.search("iphone 15").await.expect("search");
        assert_eq!(second.source, CacheSource::Cache);
        assert!(!second.is_stale);
        assert_eq!(ctx.queue.depth().await.expect("depth"), 0, "fresh hit must not refresh");
    }

    #[tokio::test]
    async fn stale_hit_serves_cache_and_enqueues_one_refresh() {
        let (_dir, ctx, pool) = test_context(single_site_registry()).await;
        let service = SearchService::new(std::sync::Arc::clone(&ctx));
        let key = search_cache_key("iphone 15");

        service.search("iphone 15").await.expect("seed cache");
        // 40 minutes old: stale under the 30-minute hot window, inside the
        // 60-minute TTL.
        backdate_cache(&pool, &key, 40).await;

        let first = service.search("iphone 15").await.expect("stale search");
        assert_eq!(first.source, CacheSource::Cache);
        assert!(first.is_stale);
        assert_eq!(first.products.len(), 1);

        let second = service.search("iphone 15").await.expect("stale search");
        assert!(second.is_stale);
        assert_eq!(
            ctx.queue.depth().await.expect("depth"),
            1,
            "concurrent stale reads must coalesce into one refresh job"
        );
    }

    #[tokio::test]
    async fn cache_hits_record_search_demand() {
        let (_dir, ctx, _pool) = test_context(single_site_registry()).await;
        let service = SearchService::new(std::sync::Arc::clone(&ctx));

        service.search("iphone 15").await.expect("cold");
        service.search("iphone 15").await.expect("cached");

        let drained = ctx.recorder.drain();
        let total: u64 = drained.values().sum();
        assert_eq!(total, 2, "cold and cached reads both count demand");
    }

    #[tokio::test]
    async fn no_adapters_yields_an_empty_fresh_response() {
        let (_dir, ctx, _pool) = test_context(ScraperRegistry::new()).await;
        let service = SearchService::new(std::sync::Arc::clone(&ctx));

        // No adapters at all: nothing scraped, nothing failed. The result
        // is an empty fresh response rather than an error.
        let response = service.search("unknown gadget").await.expect("search");
        assert!(response.products.is_empty());
        assert_eq!(response.source, CacheSource::Fresh);
    }
}
