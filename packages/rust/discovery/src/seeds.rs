//! Start-URL resolution.
//!
//! Expands `requests_from_url` entries into the URLs they list and splits the
//! result into seed sitemaps and direct product URLs.

use std::collections::HashSet;
use std::sync::LazyLock;

use catalogsync_shared::{CatalogError, Result, StartUrl};
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info, warn};

/// Matches absolute http(s) URLs inside a plain-text or CSV list.
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>,;]+"#).expect("url regex")
});

/// Start URLs split by kind, duplicates removed, order kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedStartUrls {
    /// Sitemap URLs to walk.
    pub sitemaps: Vec<String>,
    /// Product URLs that bypass the walk.
    pub products: Vec<String>,
}

/// Resolve configured start URLs.
///
/// A remote list that cannot be fetched is skipped with a warning; a URL is a
/// product URL when `product_pattern` matches it.
pub async fn resolve_start_urls(
    client: &Client,
    start_urls: &[StartUrl],
    product_pattern: &Regex,
) -> ResolvedStartUrls {
    let mut seen = HashSet::new();
    let mut resolved = ResolvedStartUrls::default();

    for start in start_urls {
        let urls = match start {
            StartUrl::Url { url } => vec![url.trim().to_string()],
            StartUrl::RequestsFromUrl { requests_from_url } => {
                match fetch_url_list(client, requests_from_url).await {
                    Ok(urls) => {
                        info!(source = %requests_from_url, count = urls.len(), "loaded remote URL list");
                        urls
                    }
                    Err(e) => {
                        warn!(source = %requests_from_url, error = %e, "skipping remote URL list");
                        continue;
                    }
                }
            }
        };

        for url in urls {
            if url.is_empty() || !seen.insert(url.clone()) {
                continue;
            }
            if product_pattern.is_match(&url) {
                debug!(%url, "start URL is a product URL");
                resolved.products.push(url);
            } else {
                resolved.sitemaps.push(url);
            }
        }
    }

    resolved
}

/// Extract every absolute URL from a document.
pub fn extract_urls(body: &str) -> Vec<String> {
    URL_RE
        .find_iter(body)
        .map(|m| m.as_str().to_string())
        .collect()
}

async fn fetch_url_list(client: &Client, url: &str) -> Result<Vec<String>> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| CatalogError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(CatalogError::Network(format!("{url}: HTTP {status}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| CatalogError::Network(format!("{url}: failed to read body: {e}")))?;

    Ok(extract_urls(&body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_pattern() -> Regex {
        Regex::new("/products/").unwrap()
    }

    #[test]
    fn extracts_urls_from_csv_and_text() {
        let body = "url,name\nhttps://a.example/sitemap.xml,A\n\"https://b.example/products/x\"\nnot a url\n";
        assert_eq!(
            extract_urls(body),
            vec![
                "https://a.example/sitemap.xml".to_string(),
                "https://b.example/products/x".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn splits_sitemaps_and_products() {
        let start = vec![
            StartUrl::Url { url: "https://shop.example/sitemap.xml".into() },
            StartUrl::Url { url: "https://shop.example/products/hat".into() },
            StartUrl::Url { url: "https://shop.example/sitemap.xml".into() },
        ];
        let resolved = resolve_start_urls(&Client::new(), &start, &product_pattern()).await;
        assert_eq!(resolved.sitemaps, vec!["https://shop.example/sitemap.xml"]);
        assert_eq!(resolved.products, vec!["https://shop.example/products/hat"]);
    }

    #[tokio::test]
    async fn expands_remote_lists() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/list.txt"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(
                "https://one.example/sitemap.xml\nhttps://two.example/products/cap\n",
            ))
            .mount(&server)
            .await;

        wiremock::Mock::given(wiremock::matchers::path("/missing.txt"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let start = vec![
            StartUrl::RequestsFromUrl {
                requests_from_url: format!("{}/list.txt", server.uri()),
            },
            StartUrl::RequestsFromUrl {
                requests_from_url: format!("{}/missing.txt", server.uri()),
            },
        ];
        let resolved = resolve_start_urls(&Client::new(), &start, &product_pattern()).await;
        assert_eq!(resolved.sitemaps, vec!["https://one.example/sitemap.xml"]);
        assert_eq!(resolved.products, vec!["https://two.example/products/cap"]);
    }
}
