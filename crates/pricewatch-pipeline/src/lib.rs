//! Pure ingestion stages: raw-record validation and delta merge.
//!
//! Nothing in this crate performs I/O. Callers decide whether to persist
//! or cache what comes out.

pub mod merge;
pub mod validate;

pub use merge::{identity_key, merge_results, DeltaComparison};
pub use validate::{validate_record, validate_records, InvalidRecord, ValidationError, ValidationOutcome};

pub const CRATE_NAME: &str = "pricewatch-pipeline";
