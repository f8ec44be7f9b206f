//! Core domain model and configuration for the pricewatch pipeline.

pub mod config;
pub mod model;

pub use config::Config;
pub use model::{
    product_id, search_cache_key, CacheEnvelope, CacheSource, JobKind, ProductTier, RawPrice,
    RawRecord, ScrapeJob, SellerInfo, ShippingInfo, ValidatedProduct,
};

pub const CRATE_NAME: &str = "pricewatch-core";
