//! Worker pool: claims jobs, fans out to adapters under the per-site rate
//! limiter, runs the validate/merge/persist pipeline, and terminates each
//! job exactly once (done, retried with backoff, or failed).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use pricewatch_adapters::{Scraper, ScraperRegistry, ScrapeError, SiteRateLimiter};
use pricewatch_core::config::{Config, WorkerSettings};
use pricewatch_core::model::{search_cache_key, RawRecord, ScrapeJob};
use pricewatch_pipeline::{merge_results, validate_records};
use pricewatch_store::{FreshnessCache, MetricsRecorder, MetricsStore, PersistenceWriter};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn, Instrument};

use crate::queue::JobQueue;

/// Shared dependencies for workers, the search service, and the scheduler.
/// Built once at startup and passed around as an `Arc`.
pub struct EngineContext {
    pub config: Config,
    pub scrapers: ScraperRegistry,
    pub limiter: SiteRateLimiter,
    pub cache: FreshnessCache,
    pub writer: PersistenceWriter,
    pub metrics: MetricsStore,
    pub recorder: MetricsRecorder,
    pub queue: Arc<dyn JobQueue>,
    pub guard: RefreshGuard,
}

/// Tracks cache keys with a refresh already in flight so a stale entry
/// read by many concurrent searches enqueues one job, not many.
#[derive(Debug, Default)]
pub struct RefreshGuard {
    in_flight: Mutex<HashSet<String>>,
}

impl RefreshGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the key. Returns `false` when a refresh is already running.
    pub fn try_begin(&self, key: &str) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.insert(key.to_string())
    }

    pub fn end(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(key);
    }
}

/// Exponential backoff for retryable failures, capped.
pub fn backoff_delay(settings: &WorkerSettings, attempt: u32) -> Duration {
    settings
        .backoff_base
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(settings.backoff_cap)
}

#[derive(Debug, Default)]
pub struct ScrapeOutcome {
    pub records: Vec<RawRecord>,
    pub failures: Vec<ScrapeError>,
}

/// Fan a query out to the given adapters. Each adapter waits for its
/// site's rate-limit token and runs under the per-adapter timeout; the
/// whole fan-out is bounded by `overall`, keeping whatever arrived in time.
pub async fn scrape_all(
    ctx: &Arc<EngineContext>,
    scrapers: Vec<Arc<dyn Scraper>>,
    query: &str,
    overall: Duration,
) -> ScrapeOutcome {
    let mut set = JoinSet::new();
    for scraper in scrapers {
        let ctx = Arc::clone(ctx);
        let query = query.to_string();
        set.spawn(async move {
            ctx.limiter.acquire(scraper.site()).await;
            match tokio::time::timeout(ctx.config.workers.scrape_timeout, scraper.search(&query)).await {
                Ok(result) => result,
                Err(_) => Err(ScrapeError::Timeout {
                    site: scraper.site().to_string(),
                }),
            }
        });
    }

    let mut outcome = ScrapeOutcome::default();
    let deadline = tokio::time::Instant::now() + overall;
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok(Ok(records)))) => outcome.records.extend(records),
            Ok(Some(Ok(Err(err)))) => {
                debug!(site = err.site(), %err, "adapter failed during fan-out");
                outcome.failures.push(err);
            }
            Ok(Some(Err(join_err))) => {
                warn!(%join_err, "adapter task panicked");
            }
            Ok(None) => break,
            Err(_) => {
                warn!(%query, "fan-out deadline reached; keeping partial results");
                set.abort_all();
                break;
            }
        }
    }
    outcome
}

/// Run one job end to end: scrape, validate, merge against the cached
/// result set, persist atomically, refresh the cache, and stamp metrics.
pub async fn execute_job(ctx: &Arc<EngineContext>, job: &ScrapeJob) -> Result<(), ScrapeError> {
    let key = search_cache_key(&job.query);
    let scrapers = match &job.site {
        Some(site) => match ctx.scrapers.get(site) {
            Some(scraper) => vec![scraper],
            None => {
                return Err(ScrapeError::Fatal {
                    site: site.clone(),
                    reason: "no adapter registered for site".to_string(),
                })
            }
        },
        None => ctx.scrapers.all().to_vec(),
    };

    let outcome = scrape_all(ctx, scrapers, &job.query, ctx.config.workers.cold_path_timeout).await;
    if outcome.records.is_empty() && !outcome.failures.is_empty() {
        // Nothing scraped at all. Retry when any failure was transient.
        let mut failures = outcome.failures;
        failures.sort_by_key(|f| !f.is_retryable());
        return Err(failures.remove(0));
    }

    let validated = validate_records(outcome.records, &ctx.config.default_currency, Utc::now());
    if !validated.invalid.is_empty() {
        debug!(
            query = %job.query,
            rejected = validated.invalid.len(),
            "records rejected by validation"
        );
    }

    let cached = ctx
        .cache
        .get(&key)
        .await
        .map(|envelope| envelope.data)
        .unwrap_or_default();
    let delta = merge_results(&cached, &validated.valid, &ctx.config.merge);
    info!(
        query = %job.query,
        new = delta.new_items.len(),
        updated = delta.updated_items.len(),
        removed = delta.removed_items.len(),
        has_changes = delta.has_changes,
        "merge complete"
    );

    let ttl = ctx.config.tiers.for_tier(job.tier()).ttl;
    let report = ctx
        .writer
        .persist_and_refresh(&ctx.cache, &key, delta.merged, ttl)
        .await;
    if let Err(err) = ctx
        .metrics
        .mark_scraped_many(&report.committed_ids(), Utc::now())
        .await
    {
        warn!(%err, "failed to stamp scrape time");
    }
    Ok(())
}

async fn run_claimed_job(ctx: &Arc<EngineContext>, job: ScrapeJob) {
    let key = search_cache_key(&job.query);
    let result = execute_job(ctx, &job).await;
    let terminal = match result {
        Ok(()) => ctx.queue.complete(job.id).await,
        Err(err) if err.is_retryable() && job.attempt + 1 < ctx.config.workers.max_attempts => {
            let delay = backoff_delay(&ctx.config.workers, job.attempt);
            info!(id = %job.id, attempt = job.attempt, ?delay, %err, "retrying job");
            ctx.queue.retry_later(&job, delay, &err.to_string()).await
        }
        Err(err) => {
            warn!(id = %job.id, attempt = job.attempt, %err, "job failed terminally");
            ctx.queue.fail(job.id, &err.to_string()).await
        }
    };
    if let Err(err) = terminal {
        warn!(id = %job.id, %err, "failed to record job outcome");
    }
    ctx.guard.end(&key);
}

/// Fixed set of worker tasks polling the shared queue until shutdown.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<EngineContext>, shutdown: watch::Receiver<bool>) -> Self {
        let handles = (0..ctx.config.workers.concurrency.max(1))
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown.clone();
                tokio::spawn(
                    worker_loop(ctx, shutdown)
                        .instrument(tracing::info_span!("worker", worker_id)),
                )
            })
            .collect();
        Self { handles }
    }

    /// Waits for every worker to observe shutdown and drain out.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(%err, "worker task panicked");
            }
        }
    }
}

async fn worker_loop(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match ctx.queue.claim_next().await {
            Ok(Some(job)) => {
                let span = tracing::info_span!(
                    "scrape_job",
                    id = %job.id,
                    kind = job.kind.as_str(),
                    query = %job.query
                );
                run_claimed_job(&ctx, job).instrument(span).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(ctx.config.workers.poll_interval) => {}
                }
            }
            Err(err) => {
                warn!(%err, "queue claim failed; backing off");
                tokio::time::sleep(ctx.config.workers.poll_interval).await;
            }
        }
    }
}
