//! Durable storage: SQLite-backed store lifecycle, freshness cache,
//! atomic persistence writer, and product metrics & tiering.

pub mod cache;
pub mod db;
pub mod metrics;
pub mod writer;

pub use cache::{CachedSearch, CacheWriteError, FreshnessCache};
pub use db::{Store, StoreError};
pub use metrics::{MetricsRecorder, MetricsStore, ProductRef, TierCounts};
pub use writer::{BatchReport, PersistenceWriter, RecordResult, UpsertOutcome};

pub const CRATE_NAME: &str = "pricewatch-store";
