//! Command-line entry point: run the full service, or poke at one piece
//! of it (one-off search, migrations, tier recompute, cache eviction).

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pricewatch_core::config::Config;
use pricewatch_engine::{build_scheduler, DurableJobQueue, Engine, SearchService, WorkerPool};
use pricewatch_store::{FreshnessCache, MetricsStore, Store};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pricewatch", about = "Product price tracking service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database if needed and run migrations.
    Migrate,
    /// Run one search against the live stack and print the results.
    Search { query: String },
    /// Run the scheduler and worker pool until interrupted.
    Run,
    /// Recompute tier assignments from current metrics.
    Tiers,
    /// Pin a product to the hot tier (or unpin with --off).
    Track {
        product_id: String,
        #[arg(long)]
        off: bool,
    },
    /// Evict cache entries past their TTL.
    Evict,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Migrate => {
            let store = Store::connect(&config.database_url).await?;
            store.close().await;
            info!("migrations applied");
        }
        Command::Search { query } => {
            let engine = Engine::bootstrap(config).await?;
            let service = SearchService::new(engine.ctx.clone());
            let response = service.search(&query).await?;
            println!(
                "# {} result(s), source: {:?}, stale: {}",
                response.products.len(),
                response.source,
                response.is_stale
            );
            for product in &response.products {
                println!(
                    "{:>10.2} {} | {} | {}",
                    product.price_amount, product.currency_symbol, product.name, product.site
                );
            }
            engine.store.close().await;
        }
        Command::Run => run(config).await?,
        Command::Tiers => {
            let store = Store::connect(&config.database_url).await?;
            let metrics = MetricsStore::new(store.pool().clone());
            let counts = metrics.update_tiers(&config.cutoffs).await?;
            println!("hot: {}, warm: {}, cold: {}", counts.hot, counts.warm, counts.cold);
            store.close().await;
        }
        Command::Track { product_id, off } => {
            let store = Store::connect(&config.database_url).await?;
            let metrics = MetricsStore::new(store.pool().clone());
            metrics.set_tracked(&product_id, !off).await?;
            println!("{} {}", if off { "untracked" } else { "tracked" }, product_id);
            store.close().await;
        }
        Command::Evict => {
            let store = Store::connect(&config.database_url).await?;
            let cache = FreshnessCache::new(store.pool().clone());
            println!("evicted {} expired entries", cache.evict_expired().await);
            store.close().await;
        }
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let engine = Engine::bootstrap(config).await?;

    // Jobs stranded in `running` by an unclean shutdown go back to the
    // queue before workers start.
    let durable = DurableJobQueue::new(engine.store.pool().clone());
    let requeued = durable.requeue_stuck(Duration::from_secs(600)).await?;
    if requeued > 0 {
        info!(requeued, "requeued jobs stranded by a previous run");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = WorkerPool::spawn(engine.ctx.clone(), shutdown_rx);

    let mut scheduler = build_scheduler(engine.ctx.clone(), engine.seeds.clone()).await?;
    scheduler.start().await.context("starting scheduler")?;
    info!(
        adapters = engine.ctx.scrapers.len(),
        workers = engine.ctx.config.workers.concurrency,
        "pricewatch running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    scheduler.shutdown().await.ok();
    shutdown_tx.send(true).ok();
    workers.join().await;
    engine.store.close().await;
    Ok(())
}
