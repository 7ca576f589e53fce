//! Product URL → lookup request resolution.

use std::sync::LazyLock;

use catalogsync_shared::{CatalogError, ProductLookupRequest, Result};
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

static HANDLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/products/([^/?#]+)").expect("handle regex"));

/// Build a lookup request from a product page URL.
///
/// The origin is scheme + host (+ port); the handle is the percent-decoded
/// path segment following `/products/`.
pub fn lookup_request(source_url: &str) -> Result<ProductLookupRequest> {
    let url = Url::parse(source_url)
        .map_err(|e| CatalogError::validation(format!("invalid product URL {source_url}: {e}")))?;

    if !url.has_host() {
        return Err(CatalogError::validation(format!(
            "product URL has no host: {source_url}"
        )));
    }
    let origin = url.origin().ascii_serialization();

    let raw = HANDLE_RE
        .captures(url.path())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            CatalogError::validation(format!(
                "cannot derive product handle from URL {source_url}"
            ))
        })?;

    let handle = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| CatalogError::validation(format!("invalid handle in {source_url}: {e}")))?
        .into_owned();

    Ok(ProductLookupRequest {
        origin,
        handle,
        source_url: source_url.to_string(),
    })
}
