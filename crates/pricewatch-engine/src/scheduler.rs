//! Cron-driven background cadence: metrics flush plus tier recompute every
//! hour, per-tier refresh sweeps, seed-query warming, and the weekly
//! demand decay. Each tick body is a plain async function so the logic is
//! testable without standing up the cron runtime.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use pricewatch_core::model::{search_cache_key, ProductTier, ScrapeJob};
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::worker::EngineContext;

/// YAML seed list of queries worth keeping warm without user traffic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRegistry {
    pub queries: Vec<SeedQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedQuery {
    pub query: String,
    #[serde(default)]
    pub tracked: bool,
}

impl QueryRegistry {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Flush accumulated search counters, then recompute tier assignments from
/// the updated totals.
pub async fn metrics_tick(ctx: &Arc<EngineContext>) -> anyhow::Result<()> {
    let flushed = ctx.metrics.flush(&ctx.recorder).await?;
    let counts = ctx.metrics.update_tiers(&ctx.config.cutoffs).await?;
    info!(
        flushed,
        hot = counts.hot,
        warm = counts.warm,
        cold = counts.cold,
        "metrics tick complete"
    );
    Ok(())
}

/// Enqueue per-product refresh jobs for every product in the tier whose
/// last scrape predates the tier's refresh interval.
pub async fn tier_refresh_tick(ctx: &Arc<EngineContext>, tier: ProductTier) -> anyhow::Result<usize> {
    let policy = ctx.config.tiers.for_tier(tier);
    let horizon = Utc::now()
        - chrono::Duration::from_std(policy.refresh_interval)
            .context("refresh interval out of range")?;
    let eligible = ctx
        .metrics
        .eligible_for_refresh(tier, horizon, ctx.config.workers.refresh_batch as i64)
        .await?;
    let enqueued = eligible.len();
    for product in eligible {
        ctx.queue
            .enqueue(ScrapeJob::for_product(
                product.product_id,
                product.name,
                product.site,
                tier,
            ))
            .await?;
    }
    if enqueued > 0 {
        info!(tier = tier.as_str(), enqueued, "tier refresh sweep enqueued jobs");
    }
    Ok(enqueued)
}

/// Keep seed queries warm: enqueue a full search for any seed whose cache
/// entry is missing or stale, one in-flight refresh per key.
pub async fn seed_queries_tick(ctx: &Arc<EngineContext>, seeds: &QueryRegistry) -> anyhow::Result<usize> {
    let freshness = ctx.config.tiers.hot.freshness;
    let mut enqueued = 0;
    for seed in &seeds.queries {
        let key = search_cache_key(&seed.query);
        let needs_refresh = match ctx.cache.get_with_metadata(&key, freshness).await {
            None => true,
            Some(hit) => hit.is_stale,
        };
        if needs_refresh && ctx.guard.try_begin(&key) {
            let tier = if seed.tracked { ProductTier::Hot } else { ProductTier::Warm };
            if let Err(err) = ctx.queue.enqueue(ScrapeJob::full_search(&seed.query, tier)).await {
                ctx.guard.end(&key);
                return Err(err.into());
            }
            enqueued += 1;
        }
    }
    Ok(enqueued)
}

/// Weekly decay of search counters so tiers reflect current demand.
pub async fn weekly_reset_tick(ctx: &Arc<EngineContext>) -> anyhow::Result<u64> {
    let reset = ctx.metrics.reset_weekly_counts().await?;
    info!(reset, "weekly search counters reset");
    Ok(reset)
}

/// Build the cron scheduler with all cadences registered. The caller
/// starts it and owns its lifetime.
pub async fn build_scheduler(
    ctx: Arc<EngineContext>,
    seeds: QueryRegistry,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let schedule = ctx.config.schedule.clone();
    let seeds = Arc::new(seeds);

    let tick_ctx = Arc::clone(&ctx);
    scheduler
        .add(Job::new_async(schedule.metrics_flush_cron.as_str(), move |_id, _sched| {
            let ctx = Arc::clone(&tick_ctx);
            Box::pin(async move {
                if let Err(err) = metrics_tick(&ctx).await {
                    warn!(%err, "metrics tick failed");
                }
            })
        })?)
        .await?;

    let tick_ctx = Arc::clone(&ctx);
    let tick_seeds = Arc::clone(&seeds);
    scheduler
        .add(Job::new_async(schedule.hot_cron.as_str(), move |_id, _sched| {
            let ctx = Arc::clone(&tick_ctx);
            let seeds = Arc::clone(&tick_seeds);
            Box::pin(async move {
                if let Err(err) = tier_refresh_tick(&ctx, ProductTier::Hot).await {
                    warn!(%err, "hot tier sweep failed");
                }
                if let Err(err) = seed_queries_tick(&ctx, &seeds).await {
                    warn!(%err, "seed query sweep failed");
                }
            })
        })?)
        .await?;

    let tick_ctx = Arc::clone(&ctx);
    scheduler
        .add(Job::new_async(schedule.warm_cron.as_str(), move |_id, _sched| {
            let ctx = Arc::clone(&tick_ctx);
            Box::pin(async move {
                if let Err(err) = tier_refresh_tick(&ctx, ProductTier::Warm).await {
                    warn!(%err, "warm tier sweep failed");
                }
            })
        })?)
        .await?;

    let tick_ctx = Arc::clone(&ctx);
    scheduler
        .add(Job::new_async(schedule.cold_cron.as_str(), move |_id, _sched| {
            let ctx = Arc::clone(&tick_ctx);
            Box::pin(async move {
                if let Err(err) = tier_refresh_tick(&ctx, ProductTier::Cold).await {
                    warn!(%err, "cold tier sweep failed");
                }
                let evicted = ctx.cache.evict_expired().await;
                if evicted > 0 {
                    info!(evicted, "expired cache entries evicted");
                }
            })
        })?)
        .await?;

    let tick_ctx = Arc::clone(&ctx);
    scheduler
        .add(Job::new_async(schedule.weekly_reset_cron.as_str(), move |_id, _sched| {
            let ctx = Arc::clone(&tick_ctx);
            Box::pin(async move {
                if let Err(err) = weekly_reset_tick(&ctx).await {
                    warn!(%err, "weekly reset failed");
                }
            })
        })?)
        .await?;

    Ok(scheduler)
}
