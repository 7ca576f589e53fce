//! Core domain types shared by the discovery, storefront, and core crates.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

static GID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^gid://shopify/[^/]+/").expect("gid regex"));

/// Canonical identifier: the platform's global-id prefix removed.
///
/// A pure function of the raw id, so the same product always yields the same
/// identifier across runs.
pub fn strip_gid(raw: &str) -> String {
    GID_RE.replace(raw, "").into_owned()
}

// ---------------------------------------------------------------------------
// SitemapEntry
// ---------------------------------------------------------------------------

/// One `<url>` or `<sitemap>` entry parsed from a sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    /// `<loc>` value, whitespace and newlines removed.
    pub url: String,
    /// Raw `<lastmod>` value, if present and non-empty.
    pub last_modified: Option<String>,
    /// `true` for a nested `<sitemap>` entry of a sitemap index.
    pub is_sitemap_index: bool,
}

impl SitemapEntry {
    /// Parse `last_modified` as RFC 3339 or a bare `YYYY-MM-DD` date.
    pub fn last_modified_at(&self) -> Option<DateTime<Utc>> {
        self.last_modified.as_deref().and_then(parse_date)
    }
}

/// Parse a sitemap-style date: RFC 3339 first, then date-only.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

// ---------------------------------------------------------------------------
// ProductLookupRequest
// ---------------------------------------------------------------------------

/// A single product to resolve through the storefront query API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductLookupRequest {
    /// Scheme + host (+ port) of the storefront.
    pub origin: String,
    /// Product handle taken from the URL path.
    pub handle: String,
    /// The product URL the handle was derived from.
    pub source_url: String,
}

// ---------------------------------------------------------------------------
// CanonicalProduct
// ---------------------------------------------------------------------------

/// A product image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductImage {
    #[serde(default)]
    pub id: Option<String>,
    pub src: String,
}

/// A product option (e.g. `Color` with its possible values).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductOption {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A product variant with its selected options flattened to `option1`, `option2`, ...
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductVariant {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub available_for_sale: Option<bool>,
    #[serde(default)]
    pub requires_shipping: Option<bool>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub weight_unit: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    /// Price amount as returned by the API (a decimal string).
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub currency_code: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    /// Positional option values keyed `option1`, `option2`, ...
    #[serde(flatten)]
    pub options: BTreeMap<String, String>,
}

impl ProductVariant {
    /// Value of the `index`-th (0-based) selected option.
    pub fn option(&self, index: usize) -> Option<&str> {
        self.options
            .get(&format!("option{}", index + 1))
            .map(String::as_str)
    }
}

/// Normalized product aggregate derived from one remote response fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalProduct {
    /// Canonical identifier (platform prefix stripped).
    pub id: String,
    /// Identifier exactly as the platform returned it.
    pub raw_id: String,
    pub title: String,
    #[serde(default)]
    pub description_html: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Featured image, also the last element of `images` when present.
    #[serde(default)]
    pub image: Option<ProductImage>,
    #[serde(default)]
    pub images: Vec<ProductImage>,
    #[serde(default)]
    pub options: Vec<ProductOption>,
    #[serde(default)]
    pub variants: Vec<ProductVariant>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
}

// ---------------------------------------------------------------------------
// OutputItem
// ---------------------------------------------------------------------------

/// Summary of one variant carried inside an [`OutputItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub id: String,
    pub sku: Option<String>,
    pub title: Option<String>,
    pub price: Option<String>,
    pub image_id: Option<String>,
}

/// Secondary fields of an [`OutputItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalInfo {
    pub variant_attributes: String,
    pub variant_title: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub barcode: Option<String>,
    pub taxcode: Option<String>,
    pub tags: Vec<String>,
    pub weight: Option<String>,
    pub variants: Vec<VariantSummary>,
    /// Remaining option properties (snake_cased option name → value).
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// The normalized record handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    pub url: String,
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub sku: String,
    pub availability: String,
    pub price: Option<f64>,
    pub currency: String,
    pub color: Option<String>,
    pub size: Option<String>,
    pub material: Option<String>,
    pub display_name: Option<String>,
    pub images_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub additional: AdditionalInfo,
}

// ---------------------------------------------------------------------------
// RunStats
// ---------------------------------------------------------------------------

/// Run summary persisted under the `STATS` key at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    /// Number of product URLs discovered (walk output + direct start URLs).
    pub count: usize,
    pub sitemaps_fetched: usize,
    /// Product URLs no lookup could be derived from.
    pub requests_failed: usize,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    pub items_emitted: usize,
    pub items_skipped: usize,
    pub transform_failures: usize,
    /// Records lost to failed sink writes; their products are emitted again
    /// by a later run.
    pub items_dropped: usize,
}
