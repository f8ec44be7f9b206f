//! Delta merge engine: reconcile a cached result set against a freshly
//! scraped one into new/updated/removed partitions plus a merged set.

use std::cmp::Ordering;
use std::collections::HashMap;

use pricewatch_core::config::MergeOptions;
use pricewatch_core::model::ValidatedProduct;
use url::Url;

/// Ephemeral result of one merge; never persisted.
#[derive(Debug, Clone, Default)]
pub struct DeltaComparison {
    /// Fresh-matched items plus new items (plus retained removals when
    /// configured), sorted ascending by price with missing prices last.
    pub merged: Vec<ValidatedProduct>,
    pub new_items: Vec<ValidatedProduct>,
    pub updated_items: Vec<ValidatedProduct>,
    pub removed_items: Vec<ValidatedProduct>,
    pub has_changes: bool,
}

/// Identity key used to line up cached and fresh items:
/// `site:normalized-url-path`, falling back to the lowercased trimmed name
/// when the URL does not parse.
pub fn identity_key(item: &ValidatedProduct) -> String {
    match Url::parse(&item.url) {
        Ok(url) => {
            let path = url.path().trim_end_matches('/').to_lowercase();
            format!("{}:{}", item.site, path)
        }
        Err(_) => format!("{}:{}", item.site, item.name.trim().to_lowercase()),
    }
}

/// Compare `cached` against `fresh` for the same query. Purely functional;
/// callers decide whether to persist or cache the outcome.
pub fn merge_results(
    cached: &[ValidatedProduct],
    fresh: &[ValidatedProduct],
    options: &MergeOptions,
) -> DeltaComparison {
    let mut cached_by_key: HashMap<String, &ValidatedProduct> = HashMap::new();
    for item in cached {
        cached_by_key.insert(identity_key(item), item);
    }

    let mut merged = Vec::with_capacity(fresh.len());
    let mut new_items = Vec::new();
    let mut updated_items = Vec::new();
    let mut significant_price_change = false;
    let mut matched_keys = Vec::with_capacity(fresh.len());

    for fresh_item in fresh {
        let key = identity_key(fresh_item);
        match cached_by_key.get(key.as_str()) {
            Some(cached_item) => {
                matched_keys.push(key);
                let combined = merge_fields(cached_item, fresh_item, options);
                if differs(cached_item, fresh_item) {
                    if price_delta_ratio(cached_item, fresh_item) > options.price_change_ratio {
                        significant_price_change = true;
                    }
                    updated_items.push(combined.clone());
                }
                merged.push(combined);
            }
            None => {
                new_items.push(fresh_item.clone());
                merged.push(fresh_item.clone());
            }
        }
    }

    for key in &matched_keys {
        cached_by_key.remove(key.as_str());
    }
    let removed_items: Vec<ValidatedProduct> =
        cached_by_key.into_values().cloned().collect();

    let removal_ratio = if cached.is_empty() {
        0.0
    } else {
        removed_items.len() as f64 / cached.len() as f64
    };

    if options.keep_removed_items && removal_ratio < options.remove_stale_threshold {
        merged.extend(removed_items.iter().cloned());
    }

    let has_changes = !new_items.is_empty()
        || significant_price_change
        || removal_ratio > options.remove_stale_threshold;

    merged.sort_by(|a, b| {
        sortable_price(a)
            .partial_cmp(&sortable_price(b))
            .unwrap_or(Ordering::Equal)
    });

    DeltaComparison {
        merged,
        new_items,
        updated_items,
        removed_items,
        has_changes,
    }
}

/// Merge one matched pair. The fresh item's price/url/image win when
/// `prioritize_new_prices` is set; all other cached fields are retained.
fn merge_fields(
    cached: &ValidatedProduct,
    fresh: &ValidatedProduct,
    options: &MergeOptions,
) -> ValidatedProduct {
    let mut combined = cached.clone();
    combined.last_checked_at = fresh.last_checked_at;
    if options.prioritize_new_prices {
        combined.price_amount = fresh.price_amount;
        combined.price_currency = fresh.price_currency.clone();
        combined.currency_symbol = fresh.currency_symbol.clone();
        combined.url = fresh.url.clone();
        combined.image_url = fresh.image_url.clone();
    }
    combined
}

fn differs(cached: &ValidatedProduct, fresh: &ValidatedProduct) -> bool {
    cached.price_amount != fresh.price_amount
        || cached.url != fresh.url
        || cached.image_url != fresh.image_url
        || cached.name != fresh.name
}

fn price_delta_ratio(cached: &ValidatedProduct, fresh: &ValidatedProduct) -> f64 {
    if cached.price_amount <= 0.0 {
        return if fresh.price_amount != cached.price_amount { f64::INFINITY } else { 0.0 };
    }
    (fresh.price_amount - cached.price_amount).abs() / cached.price_amount
}

fn sortable_price(item: &ValidatedProduct) -> f64 {
    if item.price_amount > 0.0 {
        item.price_amount
    } else {
        f64::INFINITY
    }
}
