//! Product URL discovery through sitemap trees.
//!
//! The [`SitemapWalker`] fetches sitemap documents from a durable
//! [`RequestQueue`] with a bounded pool of concurrent fetches, hands every
//! entry to a caller-supplied [`SitemapFilter`], collects the accepted leaf
//! URLs, and pushes accepted nested sitemaps back onto the queue until it
//! drains. The queue's unique-key dedup means a self-referential index is
//! fetched once; `max_documents` bounds the walk regardless.

mod parser;
mod seeds;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use catalogsync_shared::{CatalogError, RequestQueue, Result, SitemapEntry, WalkSettings};
use reqwest::{Client, StatusCode};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

pub use parser::{ParsedSitemap, cleanup, parse_sitemap};
pub use seeds::{ResolvedStartUrls, extract_urls, resolve_start_urls};

/// Maximum number of redirects to follow when fetching a sitemap.
const MAX_REDIRECTS: usize = 5;

/// Base delay between fetch retries; multiplied by the attempt number.
const RETRY_BACKOFF_MS: u64 = 200;

/// Maximum response size we consider valid (50 MB, the sitemap protocol limit).
const MAX_RESPONSE_SIZE: u64 = 50 * 1024 * 1024;

/// User-Agent string for discovery requests.
const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Decides which sitemap entries are kept.
///
/// Called with `is_sitemap_index = false` for leaf `<url>` entries and `true`
/// for nested `<sitemap>` entries.
#[async_trait]
pub trait SitemapFilter: Send + Sync {
    async fn accept(&self, entry: &SitemapEntry) -> bool;
}

#[async_trait]
impl<F> SitemapFilter for F
where
    F: Fn(&SitemapEntry) -> bool + Send + Sync,
{
    async fn accept(&self, entry: &SitemapEntry) -> bool {
        self(entry)
    }
}

// ---------------------------------------------------------------------------
// WalkResult
// ---------------------------------------------------------------------------

/// Outcome of a sitemap walk.
#[derive(Debug, Clone)]
pub struct WalkResult<T> {
    /// Mapped accepted leaf URLs, deduplicated by raw URL.
    pub items: Vec<T>,
    /// Sitemap documents fetched (including failed ones).
    pub documents_fetched: usize,
    /// Documents abandoned after retries or rejected as unparseable.
    pub documents_failed: usize,
    /// Nested sitemaps newly added to the queue.
    pub sitemaps_discovered: usize,
    /// Whether the walk stopped at the document ceiling with work left.
    pub ceiling_reached: bool,
}

// ---------------------------------------------------------------------------
// SitemapWalker
// ---------------------------------------------------------------------------

/// Recursive sitemap walker with bounded concurrency and retries.
pub struct SitemapWalker {
    client: Client,
    settings: WalkSettings,
}

impl SitemapWalker {
    /// Create a walker with the given limits.
    pub fn new(settings: WalkSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(settings.timeout)
            .build()
            .map_err(|e| CatalogError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, settings })
    }

    /// The HTTP client used for sitemap fetches.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Walk every sitemap reachable from `seeds`.
    ///
    /// Accepted leaf URLs are passed through `mapper`. When `limit > 0`,
    /// accepting stops once `limit` URLs are collected; the document being
    /// processed evaluates no further leaf entries.
    #[instrument(skip_all, fields(seeds = seeds.len(), limit))]
    pub async fn walk<T, M>(
        &self,
        seeds: &[String],
        queue: &dyn RequestQueue,
        filter: &dyn SitemapFilter,
        mapper: M,
        limit: usize,
    ) -> Result<WalkResult<T>>
    where
        M: Fn(&str) -> T,
    {
        for seed in seeds {
            queue.add_request(seed).await?;
        }

        let mut in_flight: JoinSet<(String, Result<String>)> = JoinSet::new();
        let mut accepted: HashSet<String> = HashSet::new();
        let mut result = WalkResult {
            items: Vec::new(),
            documents_fetched: 0,
            documents_failed: 0,
            sitemaps_discovered: 0,
            ceiling_reached: false,
        };

        info!(
            max_concurrency = self.settings.max_concurrency,
            max_documents = self.settings.max_documents,
            "starting sitemap walk"
        );

        loop {
            while in_flight.len() < self.settings.max_concurrency
                && result.documents_fetched < self.settings.max_documents
            {
                let Some(url) = queue.fetch_next().await? else {
                    break;
                };
                result.documents_fetched += 1;
                let client = self.client.clone();
                let retries = self.settings.retries;
                in_flight.spawn(async move {
                    let body = fetch_with_retries(&client, &url, retries).await;
                    (url, body)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            let (url, body) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "sitemap fetch task failed");
                    result.documents_failed += 1;
                    continue;
                }
            };
            queue.mark_handled(&url).await?;

            let body = match body {
                Ok(body) => body,
                Err(e) => {
                    warn!(%url, error = %e, "abandoning sitemap after retries");
                    result.documents_failed += 1;
                    continue;
                }
            };

            let parsed = match parse_sitemap(&body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(%url, error = %e, "unparseable sitemap");
                    result.documents_failed += 1;
                    continue;
                }
            };

            debug!(%url, urls = parsed.urls.len(), sitemaps = parsed.sitemaps.len(), "parsed sitemap");

            for entry in &parsed.urls {
                if !filter.accept(entry).await {
                    continue;
                }
                if limit > 0 && accepted.len() >= limit {
                    break;
                }
                if accepted.insert(entry.url.clone()) {
                    debug!(url = %entry.url, "adding product url");
                    result.items.push(mapper(&entry.url));
                }
            }

            for entry in &parsed.sitemaps {
                if filter.accept(entry).await && queue.add_request(&entry.url).await? {
                    debug!(url = %entry.url, "found sub-sitemap url");
                    result.sitemaps_discovered += 1;
                }
            }

            tokio::task::yield_now().await;
        }

        if result.documents_fetched >= self.settings.max_documents
            && queue.pending_count().await? > 0
        {
            warn!(
                max_documents = self.settings.max_documents,
                "sitemap document ceiling reached, remaining sitemaps skipped"
            );
            result.ceiling_reached = true;
        }

        info!(
            urls = result.items.len(),
            documents = result.documents_fetched,
            failed = result.documents_failed,
            "found {} URLs from {} sitemap URLs",
            result.items.len(),
            result.documents_fetched
        );

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// Fetch `url`, retrying transport failures and bad statuses up to `retries` times.
async fn fetch_with_retries(client: &Client, url: &str, retries: u32) -> Result<String> {
    let mut attempt = 0;
    loop {
        match fetch_sitemap(client, url).await {
            Ok(body) => return Ok(body),
            Err(e) if attempt < retries => {
                attempt += 1;
                debug!(%url, attempt, error = %e, "retrying sitemap fetch");
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)))
                    .await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fetch a single sitemap document. Only 200, 301 and 302 count as success.
async fn fetch_sitemap(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| CatalogError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !matches!(
        status,
        StatusCode::OK | StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
    ) {
        return Err(CatalogError::Network(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(CatalogError::validation(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    response
        .text()
        .await
        .map_err(|e| CatalogError::Network(format!("{url}: failed to read body: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// In-memory queue with unique-key dedup.
    #[derive(Default)]
    struct MemoryQueue {
        state: Mutex<(VecDeque<String>, HashSet<String>, usize)>,
    }

    #[async_trait]
    impl RequestQueue for MemoryQueue {
        async fn add_request(&self, url: &str) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            if !state.1.insert(url.to_string()) {
                return Ok(false);
            }
            state.0.push_back(url.to_string());
            Ok(true)
        }

        async fn fetch_next(&self) -> Result<Option<String>> {
            Ok(self.state.lock().unwrap().0.pop_front())
        }

        async fn mark_handled(&self, _url: &str) -> Result<()> {
            self.state.lock().unwrap().2 += 1;
            Ok(())
        }

        async fn handled_count(&self) -> Result<usize> {
            Ok(self.state.lock().unwrap().2)
        }

        async fn pending_count(&self) -> Result<usize> {
            Ok(self.state.lock().unwrap().0.len())
        }
    }

    fn settings() -> WalkSettings {
        WalkSettings {
            max_concurrency: 4,
            retries: 1,
            timeout: Duration::from_secs(5),
            max_documents: 100,
        }
    }

    fn urlset(urls: &[String]) -> String {
        let entries: String = urls
            .iter()
            .map(|u| format!("<url><loc>{u}</loc><lastmod>2024-05-01</lastmod></url>"))
            .collect();
        format!(r#"<?xml version="1.0"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</urlset>"#)
    }

    fn index(sitemaps: &[String]) -> String {
        let entries: String = sitemaps
            .iter()
            .map(|u| format!("<sitemap><loc>{u}</loc></sitemap>"))
            .collect();
        format!("<sitemapindex>{entries}</sitemapindex>")
    }

    async fn mount(server: &wiremock::MockServer, path: &str, body: String) {
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path(path))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    fn product_filter(entry: &SitemapEntry) -> bool {
        if entry.is_sitemap_index {
            entry.url.contains("sitemap_products_")
        } else {
            entry.url.contains("/products/")
        }
    }

    #[tokio::test]
    async fn walks_nested_sitemaps() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();

        mount(
            &server,
            "/sitemap.xml",
            index(&[
                format!("{base}/sitemap_products_1.xml"),
                format!("{base}/sitemap_pages_1.xml"),
            ]),
        )
        .await;
        mount(
            &server,
            "/sitemap_products_1.xml",
            urlset(&[
                format!("{base}/products/a"),
                format!("{base}/products/b"),
                format!("{base}/pages/about"),
            ]),
        )
        .await;

        let walker = SitemapWalker::new(settings()).unwrap();
        let queue = MemoryQueue::default();
        let result = walker
            .walk(
                &[format!("{base}/sitemap.xml")],
                &queue,
                &product_filter,
                |url| url.to_string(),
                0,
            )
            .await
            .unwrap();

        let mut items = result.items.clone();
        items.sort();
        assert_eq!(items, vec![format!("{base}/products/a"), format!("{base}/products/b")]);
        assert_eq!(result.documents_fetched, 2);
        assert_eq!(result.sitemaps_discovered, 1);
        assert_eq!(queue.handled_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn filter_sees_leaf_and_index_flags() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();

        mount(
            &server,
            "/sitemap.xml",
            format!(
                "<urlset><url><loc>{base}/products/a</loc><lastmod>2024-05-01</lastmod></url>\
                 <sitemap><loc>{base}/nested.xml</loc></sitemap></urlset>"
            ),
        )
        .await;

        let seen = Mutex::new(Vec::new());
        let filter = |entry: &SitemapEntry| {
            seen.lock().unwrap().push(entry.clone());
            false
        };

        let walker = SitemapWalker::new(settings()).unwrap();
        let result = walker
            .walk(
                &[format!("{base}/sitemap.xml")],
                &MemoryQueue::default(),
                &filter,
                |url| url.to_string(),
                0,
            )
            .await
            .unwrap();

        assert!(result.items.is_empty());
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].url, format!("{base}/products/a"));
        assert_eq!(seen[0].last_modified.as_deref(), Some("2024-05-01"));
        assert!(!seen[0].is_sitemap_index);
        assert!(seen[1].is_sitemap_index);
    }

    #[tokio::test]
    async fn limit_stops_accepting() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();
        let urls: Vec<String> = (0..10).map(|i| format!("{base}/products/p{i}")).collect();
        mount(&server, "/sitemap.xml", urlset(&urls)).await;

        let calls = AtomicUsize::new(0);
        let filter = |_: &SitemapEntry| {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        };

        let walker = SitemapWalker::new(settings()).unwrap();
        let result = walker
            .walk(
                &[format!("{base}/sitemap.xml")],
                &MemoryQueue::default(),
                &filter,
                |url| url.to_string(),
                3,
            )
            .await
            .unwrap();

        assert_eq!(result.items, urls[..3].to_vec());
        // Three accepted, the fourth is evaluated and hits the limit.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn duplicate_urls_are_collapsed() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();
        let url = format!("{base}/products/same");
        mount(&server, "/sitemap.xml", urlset(&[url.clone(), url.clone()])).await;

        let walker = SitemapWalker::new(settings()).unwrap();
        let result = walker
            .walk(
                &[format!("{base}/sitemap.xml")],
                &MemoryQueue::default(),
                &product_filter,
                |url| url.to_string(),
                0,
            )
            .await
            .unwrap();
        assert_eq!(result.items, vec![url]);
    }

    #[tokio::test]
    async fn failed_sitemap_is_not_fatal() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();

        mount(
            &server,
            "/sitemap.xml",
            index(&[
                format!("{base}/sitemap_products_1.xml"),
                format!("{base}/sitemap_products_2.xml"),
                format!("{base}/sitemap_products_3.xml"),
            ]),
        )
        .await;
        wiremock::Mock::given(wiremock::matchers::path("/sitemap_products_1.xml"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .expect(2) // first attempt + one retry
            .mount(&server)
            .await;
        mount(&server, "/sitemap_products_2.xml", "<urlset><url><loc>".into()).await;
        mount(
            &server,
            "/sitemap_products_3.xml",
            urlset(&[format!("{base}/products/ok")]),
        )
        .await;

        let walker = SitemapWalker::new(settings()).unwrap();
        let result = walker
            .walk(
                &[format!("{base}/sitemap.xml")],
                &MemoryQueue::default(),
                &product_filter,
                |url| url.to_string(),
                0,
            )
            .await
            .unwrap();

        assert_eq!(result.items, vec![format!("{base}/products/ok")]);
        assert_eq!(result.documents_fetched, 4);
        assert!(result.documents_failed >= 1);
    }

    #[tokio::test]
    async fn timed_out_sitemap_is_retried_then_abandoned() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();

        mount(
            &server,
            "/sitemap.xml",
            index(&[
                format!("{base}/sitemap_products_slow.xml"),
                format!("{base}/sitemap_products_fast.xml"),
            ]),
        )
        .await;
        wiremock::Mock::given(wiremock::matchers::path("/sitemap_products_slow.xml"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_string(urlset(&[format!("{base}/products/late")]))
                    .set_delay(Duration::from_secs(2)),
            )
            .expect(2)
            .mount(&server)
            .await;
        mount(
            &server,
            "/sitemap_products_fast.xml",
            urlset(&[format!("{base}/products/ok")]),
        )
        .await;

        let mut limits = settings();
        limits.timeout = Duration::from_millis(200);
        let walker = SitemapWalker::new(limits).unwrap();
        let queue = MemoryQueue::default();
        let result = walker
            .walk(
                &[format!("{base}/sitemap.xml")],
                &queue,
                &product_filter,
                |url| url.to_string(),
                0,
            )
            .await
            .unwrap();

        assert_eq!(result.items, vec![format!("{base}/products/ok")]);
        assert_eq!(result.documents_fetched, 3);
        assert_eq!(result.documents_failed, 1);
        // Abandoned documents are still marked handled.
        assert_eq!(queue.handled_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn self_referential_index_terminates() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();

        mount(
            &server,
            "/sitemap_products_1.xml",
            index(&[format!("{base}/sitemap_products_1.xml")]),
        )
        .await;

        let walker = SitemapWalker::new(settings()).unwrap();
        let result = walker
            .walk(
                &[format!("{base}/sitemap_products_1.xml")],
                &MemoryQueue::default(),
                &product_filter,
                |url| url.to_string(),
                0,
            )
            .await
            .unwrap();

        assert_eq!(result.documents_fetched, 1);
        assert_eq!(result.sitemaps_discovered, 0);
    }

    #[tokio::test]
    async fn document_ceiling_bounds_the_walk() {
        let server = wiremock::MockServer::start().await;
        let base = server.uri();

        // Every document links to two fresh children.
        for i in 0..16 {
            mount(
                &server,
                &format!("/sitemap_products_{i}.xml"),
                index(&[
                    format!("{base}/sitemap_products_{}.xml", i * 2 + 1),
                    format!("{base}/sitemap_products_{}.xml", i * 2 + 2),
                ]),
            )
            .await;
        }

        let mut limits = settings();
        limits.max_documents = 5;
        let walker = SitemapWalker::new(limits).unwrap();
        let queue = MemoryQueue::default();
        let result = walker
            .walk(
                &[format!("{base}/sitemap_products_0.xml")],
                &queue,
                &product_filter,
                |url| url.to_string(),
                0,
            )
            .await
            .unwrap();

        assert_eq!(result.documents_fetched, 5);
        assert!(result.ceiling_reached);
        // The ceiling check leaves the remaining sitemaps pending.
        assert!(queue.pending_count().await.unwrap() > 0);
        assert_eq!(queue.handled_count().await.unwrap(), 5);
    }
}
