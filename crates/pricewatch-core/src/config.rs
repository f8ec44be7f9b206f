//! Runtime configuration, environment-driven with usable defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::model::ProductTier;

/// Freshness threshold, hard TTL, and refresh cadence for one tier.
/// The freshness threshold is always strictly smaller than the TTL so a
/// stale-but-unexpired entry can still be served while a refresh runs.
#[derive(Debug, Clone, Copy)]
pub struct TierPolicy {
    pub freshness: Duration,
    pub ttl: Duration,
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TierPolicies {
    pub hot: TierPolicy,
    pub warm: TierPolicy,
    pub cold: TierPolicy,
}

impl Default for TierPolicies {
    fn default() -> Self {
        Self {
            hot: TierPolicy {
                freshness: Duration::from_secs(30 * 60),
                ttl: Duration::from_secs(60 * 60),
                refresh_interval: Duration::from_secs(60 * 60),
            },
            warm: TierPolicy {
                freshness: Duration::from_secs(2 * 60 * 60),
                ttl: Duration::from_secs(4 * 60 * 60),
                refresh_interval: Duration::from_secs(4 * 60 * 60),
            },
            cold: TierPolicy {
                freshness: Duration::from_secs(6 * 60 * 60),
                ttl: Duration::from_secs(12 * 60 * 60),
                refresh_interval: Duration::from_secs(24 * 60 * 60),
            },
        }
    }
}

impl TierPolicies {
    pub fn for_tier(&self, tier: ProductTier) -> &TierPolicy {
        match tier {
            ProductTier::Hot => &self.hot,
            ProductTier::Warm => &self.warm,
            ProductTier::Cold => &self.cold,
        }
    }
}

/// Percentile cutoffs for the full tier reassignment. Cumulative: the top
/// `hot` fraction of ranked products becomes HOT, everything above `warm`
/// becomes WARM, the rest COLD.
#[derive(Debug, Clone, Copy)]
pub struct TierCutoffs {
    pub hot: f64,
    pub warm: f64,
}

impl Default for TierCutoffs {
    fn default() -> Self {
        Self {
            hot: 0.01,
            warm: 0.20,
        }
    }
}

/// Knobs for the delta merge. The thresholds are deliberately named and
/// overridable rather than buried as literals.
#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    /// Fresh price/url/image win over cached values when set.
    pub prioritize_new_prices: bool,
    /// Retain items that disappeared from the fresh set, as long as the
    /// removal ratio stays under `remove_stale_threshold`.
    pub keep_removed_items: bool,
    /// Relative price delta above which an update counts as a change.
    pub price_change_ratio: f64,
    /// Removal ratio above which the result set counts as changed.
    pub remove_stale_threshold: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            prioritize_new_prices: true,
            keep_removed_items: false,
            price_change_ratio: 0.05,
            remove_stale_threshold: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Per-adapter scrape timeout.
    pub scrape_timeout: Duration,
    /// Overall bound on a cold-path fan-out across all adapters.
    pub cold_path_timeout: Duration,
    /// How long an idle worker sleeps before polling the queue again.
    pub poll_interval: Duration,
    /// Max products enqueued per tier refresh tick.
    pub refresh_batch: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
            scrape_timeout: Duration::from_secs(25),
            cold_path_timeout: Duration::from_secs(40),
            poll_interval: Duration::from_secs(1),
            refresh_batch: 50,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    /// Token-bucket burst size per site.
    pub per_site_burst: u32,
    pub refill_every: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            per_site_burst: 2,
            refill_every: Duration::from_millis(1500),
        }
    }
}

/// Cron expressions (with seconds field) for the four scheduler cadences.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub metrics_flush_cron: String,
    pub hot_cron: String,
    pub warm_cron: String,
    pub cold_cron: String,
    /// Weekly demand decay: search counters reset so tiers track current
    /// interest rather than all-time popularity.
    pub weekly_reset_cron: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            metrics_flush_cron: "0 0 * * * *".to_string(),
            hot_cron: "0 15 * * * *".to_string(),
            warm_cron: "0 30 */4 * * *".to_string(),
            cold_cron: "0 45 3 * * *".to_string(),
            weekly_reset_cron: "0 0 4 * * 1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// YAML registry of scraper adapter endpoints.
    pub adapters_file: PathBuf,
    /// YAML seed list of popular/tracked queries.
    pub queries_file: PathBuf,
    pub default_currency: String,
    pub tiers: TierPolicies,
    pub cutoffs: TierCutoffs,
    pub merge: MergeOptions,
    pub workers: WorkerSettings,
    pub rate_limit: RateLimitSettings,
    pub schedule: ScheduleSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://pricewatch.db".to_string(),
            adapters_file: PathBuf::from("adapters.yaml"),
            queries_file: PathBuf::from("queries.yaml"),
            default_currency: "SAR".to_string(),
            tiers: TierPolicies::default(),
            cutoffs: TierCutoffs::default(),
            merge: MergeOptions::default(),
            workers: WorkerSettings::default(),
            rate_limit: RateLimitSettings::default(),
            schedule: ScheduleSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(path) = std::env::var("PRICEWATCH_ADAPTERS_FILE") {
            config.adapters_file = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PRICEWATCH_QUERIES_FILE") {
            config.queries_file = PathBuf::from(path);
        }
        if let Ok(currency) = std::env::var("PRICEWATCH_DEFAULT_CURRENCY") {
            config.default_currency = currency;
        }
        if let Some(n) = env_parse::<usize>("PRICEWATCH_WORKERS") {
            config.workers.concurrency = n.max(1);
        }
        if let Some(n) = env_parse::<u32>("PRICEWATCH_MAX_ATTEMPTS") {
            config.workers.max_attempts = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("PRICEWATCH_SCRAPE_TIMEOUT_SECS") {
            config.workers.scrape_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PRICEWATCH_COLD_PATH_TIMEOUT_SECS") {
            config.workers.cold_path_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("PRICEWATCH_RATE_LIMIT_MS") {
            config.rate_limit.refill_every = Duration::from_millis(ms);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
