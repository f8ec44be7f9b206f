//! Canonical product records, cache envelopes, and scrape jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Price as it arrives from a scraper adapter: sites emit either a bare
/// number or a string like `"1,299.00 SAR"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    Number(f64),
    Text(String),
}

/// Unstructured scraper output. No field is guaranteed to be present or
/// well-formed; the validation pipeline is the only consumer allowed to
/// trust its contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub price: Option<RawPrice>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub site_product_id: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub seller_rating: Option<f64>,
    #[serde(default)]
    pub seller_rating_count: Option<u32>,
    #[serde(default)]
    pub seller_type: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub shipping_estimate: Option<String>,
}

/// Optional seller metadata, defaulted rather than rejected during
/// validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SellerInfo {
    pub name: Option<String>,
    pub rating: f64,
    pub rating_count: u32,
    pub seller_type: Option<String>,
    pub sku: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub raw: Option<String>,
    pub estimated_days: Option<u32>,
}

/// Canonical record produced by the validation pipeline. `product_id` is a
/// pure function of (`site`, `site_product_id`), so cache, database, and
/// metrics rows for the same real-world product always join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedProduct {
    pub product_id: String,
    pub site: String,
    pub site_product_id: String,
    pub name: String,
    pub price_amount: f64,
    pub price_currency: String,
    pub url: String,
    pub image_url: Option<String>,
    pub seller: SellerInfo,
    pub shipping: ShippingInfo,
    pub fulfilled_by_retailer: bool,
    pub currency_symbol: String,
    pub vat_inclusive: bool,
    pub is_valid: bool,
    pub last_checked_at: DateTime<Utc>,
}

/// Deterministic 16-byte product identity, hex encoded.
///
/// Identical (`site`, discriminator) inputs always yield the identical id,
/// regardless of when or where the record was scraped.
pub fn product_id(site: &str, discriminator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(site.as_bytes());
    hasher.update(b":");
    hasher.update(discriminator.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Cache key for a search query: `search:<lowercased-trimmed-query>`.
pub fn search_cache_key(query: &str) -> String {
    format!("search:{}", query.trim().to_lowercase())
}

/// Where a served result set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Fresh,
    Cache,
    Scraper,
}

/// Wire format stored in the freshness cache under a search key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub source: CacheSource,
    pub fetched_at: DateTime<Utc>,
    pub is_stale: bool,
    pub data: Vec<ValidatedProduct>,
}

/// Demand-based refresh tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductTier {
    Hot,
    Warm,
    Cold,
}

impl ProductTier {
    /// Job-queue priority for this tier.
    pub fn priority(self) -> i64 {
        match self {
            ProductTier::Hot => 10,
            ProductTier::Warm => 5,
            ProductTier::Cold => 1,
        }
    }

    pub fn from_priority(priority: i64) -> Self {
        if priority >= ProductTier::Hot.priority() {
            ProductTier::Hot
        } else if priority >= ProductTier::Warm.priority() {
            ProductTier::Warm
        } else {
            ProductTier::Cold
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProductTier::Hot => "HOT",
            ProductTier::Warm => "WARM",
            ProductTier::Cold => "COLD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HOT" => Some(ProductTier::Hot),
            "WARM" => Some(ProductTier::Warm),
            "COLD" => Some(ProductTier::Cold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullSearch,
    DeltaRefresh,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::FullSearch => "full_search",
            JobKind::DeltaRefresh => "delta_refresh",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full_search" => Some(JobKind::FullSearch),
            "delta_refresh" => Some(JobKind::DeltaRefresh),
            _ => None,
        }
    }
}

/// One unit of background scrape work. Created by the scheduler or by a
/// stale cache read; owned by the job queue until a worker terminates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub kind: JobKind,
    /// Search query driving the scrape. For per-product refreshes this is
    /// the canonical product name.
    pub query: String,
    /// Restricts the scrape to one site's adapter when set.
    pub site: Option<String>,
    pub product_id: Option<String>,
    pub priority: i64,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ScrapeJob {
    pub fn full_search(query: impl Into<String>, tier: ProductTier) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: JobKind::FullSearch,
            query: query.into(),
            site: None,
            product_id: None,
            priority: tier.priority(),
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn delta_refresh(query: impl Into<String>, tier: ProductTier) -> Self {
        Self {
            kind: JobKind::DeltaRefresh,
            ..Self::full_search(query, tier)
        }
    }

    pub fn for_product(
        product_id: impl Into<String>,
        name: impl Into<String>,
        site: impl Into<String>,
        tier: ProductTier,
    ) -> Self {
        Self {
            product_id: Some(product_id.into()),
            site: Some(site.into()),
            ..Self::delta_refresh(name, tier)
        }
    }

    pub fn tier(&self) -> ProductTier {
        ProductTier::from_priority(self.priority)
    }
}
