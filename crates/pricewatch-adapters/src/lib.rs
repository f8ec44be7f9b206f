//! Scraper adapter contract, typed failure classification, a generic
//! JSON-endpoint adapter, and the per-site rate limiter.
//!
//! Site-specific DOM parsing lives outside this workspace; everything here
//! only cares about the `search(query) -> Vec<RawRecord>` capability and
//! how its failures are classified.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use pricewatch_core::model::RawRecord;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "pricewatch-adapters";

/// Scrape failures, classified at the point of origin rather than by
/// substring-matching error messages downstream.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("timeout while scraping {site}")]
    Timeout { site: String },
    #[error("connection failure for {site}: {reason}")]
    Connection { site: String, reason: String },
    #[error("non-retryable failure for {site}: {reason}")]
    Fatal { site: String, reason: String },
}

impl ScrapeError {
    /// Transient failures are retried with backoff; fatal ones fail the
    /// job immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScrapeError::Timeout { .. } | ScrapeError::Connection { .. })
    }

    pub fn site(&self) -> &str {
        match self {
            ScrapeError::Timeout { site }
            | ScrapeError::Connection { site, .. }
            | ScrapeError::Fatal { site, .. } => site,
        }
    }
}

/// External scraper capability. Implementations must return an empty
/// vector rather than an error on "no results".
#[async_trait]
pub trait Scraper: Send + Sync {
    fn site(&self) -> &str;
    async fn search(&self, query: &str) -> Result<Vec<RawRecord>, ScrapeError>;
}

/// Typed collection of adapter implementations, keyed by site.
#[derive(Default, Clone)]
pub struct ScraperRegistry {
    scrapers: Vec<Arc<dyn Scraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scraper: Arc<dyn Scraper>) {
        self.scrapers.push(scraper);
    }

    pub fn get(&self, site: &str) -> Option<Arc<dyn Scraper>> {
        self.scrapers.iter().find(|s| s.site() == site).cloned()
    }

    pub fn all(&self) -> &[Arc<dyn Scraper>] {
        &self.scrapers
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }
}

pub fn classify_status(site: &str, status: StatusCode) -> ScrapeError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ScrapeError::Connection {
            site: site.to_string(),
            reason: format!("http status {status}"),
        }
    } else {
        ScrapeError::Fatal {
            site: site.to_string(),
            reason: format!("http status {status}"),
        }
    }
}

pub fn classify_reqwest_error(site: &str, err: &reqwest::Error) -> ScrapeError {
    if err.is_timeout() {
        ScrapeError::Timeout {
            site: site.to_string(),
        }
    } else if err.is_connect() || err.is_request() {
        ScrapeError::Connection {
            site: site.to_string(),
            reason: err.to_string(),
        }
    } else {
        // DNS failures, TLS errors, malformed bodies: not worth retrying.
        ScrapeError::Fatal {
            site: site.to_string(),
            reason: err.to_string(),
        }
    }
}

/// YAML registry describing configured adapter endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterRegistryFile {
    pub sources: Vec<AdapterSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterSource {
    pub site: String,
    /// Endpoint template with a `{query}` placeholder.
    pub endpoint: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AdapterRegistryFile {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Build a registry of HTTP adapters for every enabled source.
    pub fn into_registry(self, timeout: Duration) -> anyhow::Result<ScraperRegistry> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        let mut registry = ScraperRegistry::new();
        for source in self.sources.into_iter().filter(|s| s.enabled) {
            registry.register(Arc::new(HttpJsonScraper {
                site: source.site,
                endpoint: source.endpoint,
                client: client.clone(),
            }));
        }
        Ok(registry)
    }
}

/// Generic adapter for sites that expose a JSON search endpoint returning
/// an array of raw records.
pub struct HttpJsonScraper {
    site: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpJsonScraper {
    pub fn new(site: impl Into<String>, endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            site: site.into(),
            endpoint: endpoint.into(),
            client,
        }
    }

    fn url_for(&self, query: &str) -> String {
        let encoded: String = query
            .trim()
            .chars()
            .map(|c| if c == ' ' { '+' } else { c })
            .collect();
        self.endpoint.replace("{query}", &encoded)
    }
}

#[async_trait]
impl Scraper for HttpJsonScraper {
    fn site(&self) -> &str {
        &self.site
    }

    async fn search(&self, query: &str) -> Result<Vec<RawRecord>, ScrapeError> {
        let url = self.url_for(query);
        debug!(site = %self.site, %url, "adapter search");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&self.site, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(&self.site, status));
        }
        let records: Vec<RawRecord> = response.json().await.map_err(|e| ScrapeError::Fatal {
            site: self.site.clone(),
            reason: format!("malformed response body: {e}"),
        })?;
        Ok(records)
    }
}

/// Per-site token buckets throttling adapter invocations, decoupled from
/// the worker pool's concurrency cap.
#[derive(Debug)]
pub struct SiteRateLimiter {
    burst: u32,
    refill_every: Duration,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl SiteRateLimiter {
    pub fn new(burst: u32, refill_every: Duration) -> Self {
        Self {
            burst: burst.max(1),
            refill_every,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until the site's bucket has a token available.
    pub async fn acquire(&self, site: &str) {
        let bucket = {
            let mut buckets = self.buckets.lock().await;
            buckets
                .entry(site.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.burst, self.refill_every)))
                .clone()
        };
        bucket.take().await;
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct StaticScraper {
        site: &'static str,
    }

    #[async_trait]
    impl Scraper for StaticScraper {
        fn site(&self) -> &str {
            self.site
        }

        async fn search(&self, _query: &str) -> Result<Vec<RawRecord>, ScrapeError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn registry_finds_adapters_by_site() {
        let mut registry = ScraperRegistry::new();
        registry.register(Arc::new(StaticScraper { site: "noon.com" }));
        registry.register(Arc::new(StaticScraper { site: "amazon.sa" }));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("noon.com").is_some());
        assert!(registry.get("jarir.com").is_none());
    }

    #[test]
    fn status_classification_splits_retryable_from_fatal() {
        assert!(classify_status("s", StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(classify_status("s", StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!classify_status("s", StatusCode::NOT_FOUND).is_retryable());
        assert!(!classify_status("s", StatusCode::UNAUTHORIZED).is_retryable());
    }

    #[test]
    fn registry_file_parses_and_filters_disabled_sources() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            "sources:\n  - site: noon.com\n    endpoint: \"https://api.noon.test/search?q={{query}}\"\n  - site: legacy.shop\n    endpoint: \"https://legacy.test/{{query}}\"\n    enabled: false\n"
        )
        .expect("write yaml");

        let parsed = AdapterRegistryFile::load(file.path()).expect("load yaml");
        assert_eq!(parsed.sources.len(), 2);
        let registry = parsed
            .into_registry(Duration::from_secs(5))
            .expect("build registry");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("noon.com").is_some());
        assert!(registry.get("legacy.shop").is_none());
    }

    #[test]
    fn endpoint_template_substitutes_query() {
        let scraper = HttpJsonScraper::new(
            "noon.com",
            "https://api.noon.test/search?q={query}",
            reqwest::Client::new(),
        );
        assert_eq!(
            scraper.url_for(" iphone 15 "),
            "https://api.noon.test/search?q=iphone+15"
        );
    }

    #[tokio::test]
    async fn rate_limiter_allows_burst_then_blocks() {
        let limiter = SiteRateLimiter::new(2, Duration::from_millis(40));
        let started = Instant::now();
        limiter.acquire("noon.com").await;
        limiter.acquire("noon.com").await;
        assert!(started.elapsed() < Duration::from_millis(30), "burst should not block");

        limiter.acquire("noon.com").await;
        assert!(
            started.elapsed() >= Duration::from_millis(30),
            "third acquire should wait for a refill"
        );
    }

    #[tokio::test]
    async fn rate_limiter_buckets_are_per_site() {
        let limiter = SiteRateLimiter::new(1, Duration::from_millis(200));
        let started = Instant::now();
        limiter.acquire("noon.com").await;
        limiter.acquire("amazon.sa").await;
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "different sites must not share a bucket"
        );
    }
}
