//! Validation & normalization pipeline.
//!
//! Five ordered stages turn a `RawRecord` into a canonical
//! `ValidatedProduct`: schema presence, value validation, defaults,
//! normalize & identify, enrich. A failure in any stage rejects that one
//! record; batch processing isolates failures so a bad record never blocks
//! its siblings.

use chrono::{DateTime, Utc};
use pricewatch_core::model::{
    product_id, RawPrice, RawRecord, SellerInfo, ShippingInfo, ValidatedProduct,
};
use thiserror::Error;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;
use url::Url;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("schema validation failed; missing fields: {}", missing.join(", "))]
    Schema { missing: Vec<&'static str> },
    #[error("value validation failed for {field}: {reason}")]
    Value { field: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct InvalidRecord {
    pub record: RawRecord,
    pub error: ValidationError,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub valid: Vec<ValidatedProduct>,
    pub invalid: Vec<InvalidRecord>,
}

/// Validate a batch, partitioning into valid and invalid records.
pub fn validate_records(
    records: Vec<RawRecord>,
    default_currency: &str,
    now: DateTime<Utc>,
) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    for record in records {
        match validate_record(&record, default_currency, now) {
            Ok(product) => outcome.valid.push(product),
            Err(error) => {
                debug!(?record, %error, "rejecting raw record");
                outcome.invalid.push(InvalidRecord { record, error });
            }
        }
    }
    outcome
}

/// Run all five stages over a single raw record.
pub fn validate_record(
    raw: &RawRecord,
    default_currency: &str,
    now: DateTime<Utc>,
) -> Result<ValidatedProduct, ValidationError> {
    // Stage A: schema presence.
    let mut missing = Vec::new();
    let raw_name = present(&raw.product_name);
    if raw_name.is_none() {
        missing.push("product_name");
    }
    if raw.price.is_none() {
        missing.push("price");
    }
    let raw_url = present(&raw.url);
    if raw_url.is_none() {
        missing.push("url");
    }
    let raw_site = present(&raw.site);
    if raw_site.is_none() {
        missing.push("site");
    }
    let (Some(raw_name), Some(raw_price), Some(raw_url), Some(raw_site)) =
        (raw_name, raw.price.as_ref(), raw_url, raw_site)
    else {
        return Err(ValidationError::Schema { missing });
    };

    // Stage B: value validation.
    let price_amount = parse_price(raw_price)?;
    let url = canonical_url(raw_url)?;
    let image_url = raw.image_url.as_deref().and_then(usable_image_url);

    // Stage C: defaults for optional seller/shipping metadata.
    let seller = SellerInfo {
        name: trimmed(&raw.seller_name),
        rating: raw.seller_rating.unwrap_or(0.0),
        rating_count: raw.seller_rating_count.unwrap_or(0),
        seller_type: trimmed(&raw.seller_type),
        sku: trimmed(&raw.sku),
    };

    // Stage D: normalize and derive the stable identity.
    let name = normalize_name(raw_name);
    let site = raw_site.trim().to_lowercase();
    let site_product_id = match trimmed(&raw.site_product_id) {
        Some(id) => id,
        None => derive_site_product_id(&url),
    };
    let product_id = product_id(&site, &site_product_id);
    let price_currency = normalize_currency(raw.currency.as_deref(), default_currency);

    // Stage E: enrichment derived from free-text metadata.
    let fulfilled_by_retailer = seller
        .seller_type
        .as_deref()
        .map(is_retailer_fulfilled)
        .unwrap_or(false);
    let shipping = ShippingInfo {
        raw: trimmed(&raw.shipping_estimate),
        estimated_days: raw.shipping_estimate.as_deref().and_then(first_integer),
    };

    Ok(ValidatedProduct {
        product_id,
        site,
        site_product_id,
        name,
        price_amount: round_2dp(price_amount),
        currency_symbol: currency_symbol(&price_currency).to_string(),
        vat_inclusive: vat_inclusive(&price_currency),
        price_currency,
        url: url.to_string(),
        image_url,
        seller,
        shipping,
        fulfilled_by_retailer,
        is_valid: true,
        last_checked_at: now,
    })
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn parse_price(price: &RawPrice) -> Result<f64, ValidationError> {
    let amount = match price {
        RawPrice::Number(n) => *n,
        RawPrice::Text(text) => {
            // Strip currency symbols and thousands separators, keep digits
            // and at most the decimal point.
            let cleaned: String = text
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            cleaned.parse::<f64>().map_err(|_| ValidationError::Value {
                field: "price",
                reason: format!("unparseable price text {text:?}"),
            })?
        }
    };
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ValidationError::Value {
            field: "price",
            reason: format!("price must be a finite positive number, got {amount}"),
        });
    }
    Ok(amount)
}

fn canonical_url(raw_url: &str) -> Result<Url, ValidationError> {
    let mut url = Url::parse(raw_url.trim()).map_err(|e| ValidationError::Value {
        field: "url",
        reason: format!("not an absolute url: {e}"),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::Value {
            field: "url",
            reason: format!("unsupported scheme {:?}", url.scheme()),
        });
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Placeholder images are nulled rather than rejected.
fn usable_image_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    if lower.contains("placeholder") || lower.contains("no-image") || lower.contains("noimage") {
        return None;
    }
    if lower.starts_with("data:") {
        return None;
    }
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return None;
    }
    Some(trimmed.to_string())
}

/// NFKC-normalize and whitespace-collapse a product name.
fn normalize_name(raw: &str) -> String {
    raw.nfkc()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Path segments that carry no product identity on their own.
const GENERIC_SEGMENTS: &[&str] = &["p", "dp", "gp", "product", "products", "item", "items", "en", "ar"];

/// Generic fallback: the last meaningful path segment. Site-specific id
/// extraction is an adapter concern; this only has to be deterministic.
fn derive_site_product_id(url: &Url) -> String {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let meaningful = segments
        .iter()
        .rev()
        .find(|seg| !GENERIC_SEGMENTS.contains(&seg.to_lowercase().as_str()));
    match meaningful.or_else(|| segments.last()) {
        Some(segment) => segment.to_lowercase(),
        None => url.path().to_lowercase(),
    }
}

fn normalize_currency(raw: Option<&str>, default_currency: &str) -> String {
    let candidate = raw.map(str::trim).unwrap_or("");
    if candidate.len() == 3 && candidate.chars().all(|c| c.is_ascii_alphabetic()) {
        candidate.to_uppercase()
    } else {
        default_currency.to_string()
    }
}

fn currency_symbol(currency: &str) -> &'static str {
    match currency {
        "SAR" => "ر.س",
        "AED" => "د.إ",
        "USD" => "$",
        "EUR" => "€",
        "GBP" => "£",
        "KWD" => "د.ك",
        _ => "",
    }
}

/// Gulf-market listed prices are VAT inclusive.
fn vat_inclusive(currency: &str) -> bool {
    matches!(currency, "SAR" | "AED")
}

fn is_retailer_fulfilled(seller_type: &str) -> bool {
    let lower = seller_type.to_lowercase();
    lower.contains("fulfilled") || lower.contains("official") || lower == "retail"
}

/// First integer embedded in free text, e.g. "ships in 3-5 days" -> 3.
fn first_integer(text: &str) -> Option<u32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}

fn round_2dp(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_core::model::RawPrice;

    fn raw(name: &str, price: RawPrice, url: &str, site: &str) -> RawRecord {
        RawRecord {
            product_name: Some(name.to_string()),
            price: Some(price),
            url: Some(url.to_string()),
            site: Some(site.to_string()),
            ..RawRecord::default()
        }
    }

    #[test]
    fn missing_fields_are_all_reported() {
        let record = RawRecord {
            product_name: Some("iPhone 15".into()),
            ..RawRecord::default()
        };
        let err = validate_record(&record, "SAR", Utc::now()).unwrap_err();
        match err {
            ValidationError::Schema { missing } => {
                assert_eq!(missing, vec!["price", "url", "site"]);
            }
            other => panic!("expected schema error, got {other}"),
        }
    }

    #[test]
    fn price_text_with_symbols_and_commas_parses() {
        let record = raw(
            "TV",
            RawPrice::Text("1,299.00 SAR".into()),
            "https://noon.com/item/tv-55",
            "noon.com",
        );
        let product = validate_record(&record, "SAR", Utc::now()).unwrap();
        assert_eq!(product.price_amount, 1299.0);
    }

    #[test]
    fn non_positive_and_unparseable_prices_are_rejected() {
        for bad in [RawPrice::Number(0.0), RawPrice::Number(-3.5), RawPrice::Text("call us".into())] {
            let record = raw("TV", bad, "https://noon.com/item/tv", "noon.com");
            let err = validate_record(&record, "SAR", Utc::now()).unwrap_err();
            assert!(matches!(err, ValidationError::Value { field: "price", .. }));
        }
    }

    #[test]
    fn relative_urls_are_rejected() {
        let record = raw("TV", RawPrice::Number(10.0), "/item/tv", "noon.com");
        let err = validate_record(&record, "SAR", Utc::now()).unwrap_err();
        assert!(matches!(err, ValidationError::Value { field: "url", .. }));
    }

    #[test]
    fn query_string_is_stripped_from_url() {
        let record = raw(
            "TV",
            RawPrice::Number(10.0),
            "https://noon.com/item/tv-55?ref=tracking&utm=x#reviews",
            "noon.com",
        );
        let product = validate_record(&record, "SAR", Utc::now()).unwrap();
        assert_eq!(product.url, "https://noon.com/item/tv-55");
    }

    #[test]
    fn placeholder_images_are_nulled_not_rejected() {
        let mut record = raw("TV", RawPrice::Number(10.0), "https://noon.com/item/tv", "noon.com");
        for bad in [
            "https://cdn.noon.com/placeholder.png",
            "https://cdn.noon.com/no-image.jpg",
            "data:image/svg+xml;base64,xyz",
            "/relative/image.png",
        ] {
            record.image_url = Some(bad.to_string());
            let product = validate_record(&record, "SAR", Utc::now()).unwrap();
            assert_eq!(product.image_url, None, "{bad} should be filtered");
            assert!(product.is_valid);
        }
        record.image_url = Some("https://cdn.noon.com/real/tv.jpg".to_string());
        let product = validate_record(&record, "SAR", Utc::now()).unwrap();
        assert_eq!(product.image_url.as_deref(), Some("https://cdn.noon.com/real/tv.jpg"));
    }

    #[test]
    fn name_is_unicode_normalized_and_whitespace_collapsed() {
        // U+FF29 FULLWIDTH LATIN CAPITAL LETTER I normalizes to "I" under NFKC.
        let record = raw(
            "\u{FF29}Phone  15\t Pro ",
            RawPrice::Number(10.0),
            "https://noon.com/item/iphone-15-pro",
            "  Noon.COM ",
        );
        let product = validate_record(&record, "SAR", Utc::now()).unwrap();
        assert_eq!(product.name, "IPhone 15 Pro");
        assert_eq!(product.site, "noon.com");
    }

    #[test]
    fn site_product_id_falls_back_to_last_meaningful_segment() {
        let record = raw(
            "TV",
            RawPrice::Number(10.0),
            "https://amazon.sa/Samsung-TV/dp/B0ABCDEF12/",
            "amazon.sa",
        );
        let product = validate_record(&record, "SAR", Utc::now()).unwrap();
        assert_eq!(product.site_product_id, "b0abcdef12");
    }

    #[test]
    fn explicit_site_product_id_wins_over_url_derivation() {
        let mut record = raw("TV", RawPrice::Number(10.0), "https://noon.com/item/xyz", "noon.com");
        record.site_product_id = Some("N12345".into());
        let product = validate_record(&record, "SAR", Utc::now()).unwrap();
        assert_eq!(product.site_product_id, "N12345");
        assert_eq!(product.product_id, product_id("noon.com", "N12345"));
    }

    #[test]
    fn product_id_ignores_scrape_timestamp() {
        let record = raw("TV", RawPrice::Number(10.0), "https://noon.com/item/tv-55", "noon.com");
        let a = validate_record(&record, "SAR", Utc::now()).unwrap();
        let b = validate_record(&record, "SAR", Utc::now() + chrono::Duration::hours(5)).unwrap();
        assert_eq!(a.product_id, b.product_id);
    }

    #[test]
    fn validation_is_idempotent_over_its_own_output() {
        let record = raw(
            "Galaxy  S24",
            RawPrice::Text("3,499 SAR".into()),
            "https://jarir.com/product/galaxy-s24?src=home",
            "Jarir.com",
        );
        let first = validate_record(&record, "SAR", Utc::now()).unwrap();

        let again = RawRecord {
            product_name: Some(first.name.clone()),
            price: Some(RawPrice::Number(first.price_amount)),
            url: Some(first.url.clone()),
            site: Some(first.site.clone()),
            currency: Some(first.price_currency.clone()),
            site_product_id: Some(first.site_product_id.clone()),
            ..RawRecord::default()
        };
        let second = validate_record(&again, "SAR", Utc::now()).unwrap();
        assert_eq!(second.product_id, first.product_id);
        assert_eq!(second.price_amount, first.price_amount);
        assert!(second.is_valid);
    }

    #[test]
    fn currency_defaults_and_enrichment() {
        let mut record = raw("TV", RawPrice::Number(10.0), "https://noon.com/item/tv", "noon.com");
        record.currency = Some("riyal".into());
        record.seller_type = Some("Fulfilled by Noon".into());
        record.shipping_estimate = Some("ships in 3-5 days".into());
        let product = validate_record(&record, "SAR", Utc::now()).unwrap();
        assert_eq!(product.price_currency, "SAR");
        assert_eq!(product.currency_symbol, "ر.س");
        assert!(product.vat_inclusive);
        assert!(product.fulfilled_by_retailer);
        assert_eq!(product.shipping.estimated_days, Some(3));
        assert_eq!(product.seller.rating, 0.0);
        assert_eq!(product.seller.rating_count, 0);
    }

    #[test]
    fn batch_isolates_bad_records() {
        let good = raw("TV", RawPrice::Number(10.0), "https://noon.com/item/tv", "noon.com");
        let bad = RawRecord::default();
        let also_good = raw("Phone", RawPrice::Number(20.0), "https://noon.com/item/phone", "noon.com");
        let outcome = validate_records(vec![good, bad, also_good], "SAR", Utc::now());
        assert_eq!(outcome.valid.len(), 2);
        assert_eq!(outcome.invalid.len(), 1);
        assert!(matches!(outcome.invalid[0].error, ValidationError::Schema { .. }));
    }
}
