//! Runtime wiring: durable job queue, worker pool, search service, and the
//! cron scheduler, all sharing one `EngineContext`.

use std::sync::Arc;

use anyhow::Context;
use pricewatch_adapters::{AdapterRegistryFile, SiteRateLimiter};
use pricewatch_core::config::Config;
use pricewatch_store::{FreshnessCache, MetricsRecorder, MetricsStore, PersistenceWriter, Store};

pub mod queue;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use queue::{DurableJobQueue, JobQueue, MemoryJobQueue, QueueError};
pub use scheduler::{build_scheduler, QueryRegistry, SeedQuery};
pub use service::{SearchResponse, SearchService};
pub use worker::{backoff_delay, execute_job, EngineContext, RefreshGuard, WorkerPool};

pub const CRATE_NAME: &str = "pricewatch-engine";

/// Everything a running instance needs, built from configuration.
pub struct Engine {
    pub ctx: Arc<EngineContext>,
    pub store: Store,
    pub seeds: QueryRegistry,
}

impl Engine {
    /// Connect storage, load the adapter and seed registries, and assemble
    /// the shared context.
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let store = Store::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        let pool = store.pool().clone();

        let scrapers = AdapterRegistryFile::load(&config.adapters_file)?
            .into_registry(config.workers.scrape_timeout)?;
        let seeds = QueryRegistry::load(&config.queries_file).unwrap_or_else(|err| {
            tracing::warn!(%err, "no seed queries loaded");
            QueryRegistry::default()
        });

        let limiter = SiteRateLimiter::new(
            config.rate_limit.per_site_burst,
            config.rate_limit.refill_every,
        );
        let queue = Arc::new(DurableJobQueue::new(pool.clone()));
        let ctx = Arc::new(EngineContext {
            config,
            scrapers,
            limiter,
            cache: FreshnessCache::new(pool.clone()),
            writer: PersistenceWriter::new(pool.clone()),
            metrics: MetricsStore::new(pool),
            recorder: MetricsRecorder::new(),
            queue,
            guard: RefreshGuard::new(),
        });
        Ok(Self { ctx, store, seeds })
    }
}
