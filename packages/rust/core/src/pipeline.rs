//! End-to-end `run` pipeline: start URLs → sitemap walk → product requests →
//! batched storefront lookups → transforms → dedup → sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use catalogsync_discovery::{SitemapFilter, SitemapWalker, resolve_start_urls};
use catalogsync_shared::{
    CanonicalProduct, CatalogError, KeyValueStore, RequestQueue, Result, RunConfig, RunStats,
    SitemapEntry, Sink,
};
use catalogsync_storefront::{
    BatchExecutor, BatchHandler, HostBatchScheduler, ResolvedProduct, SchedulerSettings,
    StorefrontClient, lookup_request,
};
use catalogsync_transform::{CompiledTransform, TransformBuilder};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dedup::{OutputBuffer, ProcessedIdSet, STATS_KEY};
use crate::record::map_to_record;

/// Key of the lifecycle hook source.
pub const SCRAPER_HOOK_KEY: &str = "extendScraperFunction";

/// Key of the per-record output transform source.
pub const OUTPUT_TRANSFORM_KEY: &str = "extendOutputFunction";

/// Lifecycle labels passed to the scraper hook.
pub mod labels {
    pub const SETUP: &str = "SETUP";
    pub const FILTER_SITEMAP_URL: &str = "FILTER_SITEMAP_URL";
    pub const RUN: &str = "RUN";
    pub const FINISHED: &str = "FINISHED";
}

/// External collaborators of one run.
#[derive(Clone)]
pub struct RunServices {
    /// Durable queue of sitemap documents to walk.
    pub sitemaps: Arc<dyn RequestQueue>,
    /// Durable queue of product URLs to handle.
    pub products: Arc<dyn RequestQueue>,
    /// Persisted run state (`PROCESSED_IDS`, `STATS`).
    pub store: Arc<dyn KeyValueStore>,
    /// Output dataset.
    pub sink: Arc<dyn Sink>,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each product URL is handled.
    fn product_handled(&self, url: &str, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, stats: &RunStats);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn product_handled(&self, _url: &str, _current: usize, _total: usize) {}
    fn done(&self, _stats: &RunStats) {}
}

// ---------------------------------------------------------------------------
// Scraper hook
// ---------------------------------------------------------------------------

/// The operator's lifecycle hook, compiled once per run.
struct ScraperHook {
    transform: CompiledTransform,
}

impl ScraperHook {
    fn compile(config: &RunConfig) -> Result<Self> {
        let transform = TransformBuilder::new(SCRAPER_HOOK_KEY)
            .source(config.extend_scraper_function.as_deref())
            .helper("customData", config.custom_data.clone())
            .compile()?;
        Ok(Self { transform })
    }

    /// Invoke the hook for `label`. A failing invocation yields no outputs.
    fn invoke(&self, label: &str, mut context: Map<String, Value>) -> Vec<Value> {
        if self.transform.is_identity() {
            return Vec::new();
        }
        context.insert("label".into(), Value::String(label.into()));
        match self.transform.evaluate(&Value::Null, &Value::Object(context)) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(label, error = %e, "scraper hook failed");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sitemap filter
// ---------------------------------------------------------------------------

/// Keeps product pages and product sitemaps.
struct ProductFilter {
    product_path: Regex,
    product_sitemap: Regex,
    updated_since: Option<DateTime<Utc>>,
    hook: Arc<ScraperHook>,
}

#[async_trait]
impl SitemapFilter for ProductFilter {
    async fn accept(&self, entry: &SitemapEntry) -> bool {
        if entry.is_sitemap_index {
            return self.product_sitemap.is_match(&entry.url);
        }
        if !self.product_path.is_match(&entry.url) {
            return false;
        }
        if let (Some(since), Some(modified)) = (self.updated_since, entry.last_modified_at()) {
            if modified < since {
                debug!(url = %entry.url, "skipping product not updated since cutoff");
                return false;
            }
        }

        let mut context = Map::new();
        context.insert("url".into(), Value::String(entry.url.clone()));
        context.insert(
            "lastmod".into(),
            entry.last_modified.clone().map_or(Value::Null, Value::String),
        );
        context.insert("isSitemap".into(), Value::Bool(false));
        context.insert("isProduct".into(), Value::Bool(true));

        let outputs = self.hook.invoke(labels::FILTER_SITEMAP_URL, context);
        !outputs.iter().any(|v| *v == Value::Bool(false))
    }
}

// ---------------------------------------------------------------------------
// Batch handler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct EmitCounters {
    skipped: AtomicUsize,
    transform_failures: AtomicUsize,
}

/// Runs the output transform for every product not emitted before and
/// buffers its records under the product's claim.
struct ProductHandler {
    transform: CompiledTransform,
    processed: Arc<ProcessedIdSet>,
    buffer: Arc<OutputBuffer>,
    counters: Arc<EmitCounters>,
}

#[async_trait]
impl BatchHandler for ProductHandler {
    async fn handle(&self, origin: &str, products: Vec<ResolvedProduct>) {
        for ResolvedProduct { request, product } in products {
            if !self.processed.try_claim(&product.id) {
                debug!(id = %product.id, url = %request.source_url, "product already processed");
                self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            let outputs = transform_input(&product, &request.source_url)
                .and_then(|data| self.transform.evaluate(&data, &Value::Object(Map::new())));
            let records = match outputs {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        origin,
                        url = %request.source_url,
                        id = %product.id,
                        error = %e,
                        "output transform failed, dropping product"
                    );
                    self.counters.transform_failures.fetch_add(1, Ordering::SeqCst);
                    self.processed.release(&product.id);
                    continue;
                }
            };

            let produced = records.len();
            // A failed write has already released the claims of its chunk.
            if let Err(e) = self.buffer.push(&product.id, records).await {
                warn!(origin, id = %product.id, error = %e, "failed to write product records");
                continue;
            }
            debug!(id = %product.id, produced, "product emitted");
        }
    }
}

/// `{ product, url }`, the data value the output transform maps from.
fn transform_input(product: &CanonicalProduct, url: &str) -> Result<Value> {
    let product = serde_json::to_value(product)
        .map_err(|e| CatalogError::Transform(format!("cannot serialize product: {e}")))?;
    Ok(json!({ "product": product, "url": url }))
}

/// Base map stage of the output transform.
fn record_from_input(data: &Value, currency: &str) -> Result<Value> {
    let product: CanonicalProduct = serde_json::from_value(data["product"].clone())
        .map_err(|e| CatalogError::Transform(format!("invalid product input: {e}")))?;
    let url = data["url"].as_str().unwrap_or_default();
    serde_json::to_value(map_to_record(&product, url, currency, Utc::now()))
        .map_err(|e| CatalogError::Transform(format!("cannot serialize record: {e}")))
}

fn compile_output_transform(config: &RunConfig) -> Result<CompiledTransform> {
    let currency = config.currency.clone();
    TransformBuilder::new(OUTPUT_TRANSFORM_KEY)
        .source(config.extend_output_function.as_deref())
        .map(move |data, _context| record_from_input(data, &currency))
        .helper("customData", config.custom_data.clone())
        .compile()
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Run the full ingestion pipeline.
///
/// 1. Compile transforms (a compile error aborts before any network activity)
/// 2. Resolve start URLs, run the `SETUP` hook
/// 3. Walk sitemaps
/// 4. Hand product URLs to the batch scheduler, up to the request ceiling
/// 5. Wait for in-flight batches, flush output, persist run state
///
/// Sink write failures do not abort the run: the affected products are
/// counted in `items_dropped` and stay unprocessed for the next run.
///
/// Cancelling `cancel` stops discovery and enqueueing; batches already in
/// flight complete and run state is still saved.
#[instrument(skip_all, fields(start_urls = config.start_urls.len()))]
pub async fn run(
    config: &RunConfig,
    services: RunServices,
    cancel: CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<RunStats> {
    let start = Instant::now();

    // --- Phase 1: Setup ---
    progress.phase("Compiling transforms");
    let hook = Arc::new(ScraperHook::compile(config)?);
    let processed = Arc::new(ProcessedIdSet::load(services.store.as_ref()).await?);
    let buffer = Arc::new(OutputBuffer::new(
        services.sink.clone(),
        processed.clone(),
        config.buffer_size,
        config.buffer_writes,
    ));
    let counters = Arc::new(EmitCounters::default());
    let output_transform = compile_output_transform(config)?;

    let executor: Arc<dyn BatchExecutor> =
        Arc::new(StorefrontClient::new(config.storefront.clone())?);
    let walker = SitemapWalker::new(config.walk.clone())?;

    // --- Phase 2: Start URLs ---
    progress.phase("Resolving start URLs");
    let resolved =
        resolve_start_urls(walker.client(), &config.start_urls, &config.product_path_pattern)
            .await;
    let mut seeds = resolved.sitemaps;

    let mut context = Map::new();
    context.insert("sitemapUrls".into(), json!(seeds));
    for output in hook.invoke(labels::SETUP, context) {
        if let Value::String(url) = output {
            if !seeds.contains(&url) {
                debug!(%url, "seed added by scraper hook");
                seeds.push(url);
            }
        }
    }

    // --- Phase 3: Sitemap walk ---
    progress.phase("Walking sitemaps");
    let filter = ProductFilter {
        product_path: config.product_path_pattern.clone(),
        product_sitemap: config.product_sitemap_pattern.clone(),
        updated_since: config.updated_since,
        hook: hook.clone(),
    };
    let walked = tokio::select! {
        result = walker.walk(
            &seeds,
            services.sitemaps.as_ref(),
            &filter,
            |url: &str| url.to_string(),
            config.max_requests_per_crawl,
        ) => Some(result?),
        () = cancel.cancelled() => {
            warn!("cancelled during sitemap walk");
            None
        }
    };

    let mut stats = RunStats::default();
    let mut seen = HashSet::new();
    let mut product_urls = Vec::new();
    let walked_items = match walked {
        Some(walk) => {
            stats.sitemaps_fetched = walk.documents_fetched;
            walk.items
        }
        None => Vec::new(),
    };
    for url in resolved.products.into_iter().chain(walked_items) {
        if seen.insert(url.clone()) {
            product_urls.push(url);
        }
    }
    stats.count = product_urls.len();
    services
        .store
        .set_value(STATS_KEY, &json!({ "count": stats.count }))
        .await?;
    info!(products = stats.count, "product URLs discovered");

    // --- Phase 4: Product requests ---
    progress.phase("Fetching products");
    let scheduler = HostBatchScheduler::new(
        SchedulerSettings::from(&config.storefront),
        executor,
        Arc::new(ProductHandler {
            transform: output_transform,
            processed: processed.clone(),
            buffer: buffer.clone(),
            counters: counters.clone(),
        }),
    );

    let mut context = Map::new();
    context.insert("productCount".into(), json!(stats.count));
    for output in hook.invoke(labels::RUN, context) {
        debug!(%output, "RUN hook output");
    }

    stats.requests_failed = handle_products(
        config,
        &services,
        &product_urls,
        &scheduler,
        &cancel,
        progress,
    )
    .await?;

    // --- Phase 5: Drain and persist ---
    progress.phase("Waiting for batches");
    let batches = scheduler.finish().await;
    // A failed final write releases its claims, so the ids saved below only
    // cover records that reached the sink.
    if let Err(e) = buffer.flush().await {
        warn!(error = %e, "final output flush failed");
    }
    stats.batches_succeeded = batches.batches_succeeded;
    stats.batches_failed = batches.batches_failed;
    stats.items_emitted = buffer.written();
    stats.items_dropped = buffer.dropped();
    stats.items_skipped = counters.skipped.load(Ordering::SeqCst);
    stats.transform_failures = counters.transform_failures.load(Ordering::SeqCst);

    let stats_value = serde_json::to_value(&stats)
        .map_err(|e| CatalogError::Storage(format!("cannot serialize stats: {e}")))?;
    let mut context = Map::new();
    context.insert("stats".into(), stats_value.clone());
    for output in hook.invoke(labels::FINISHED, context) {
        debug!(%output, "FINISHED hook output");
    }

    processed.save(services.store.as_ref()).await?;
    services.store.set_value(STATS_KEY, &stats_value).await?;

    info!(
        emitted = stats.items_emitted,
        skipped = stats.items_skipped,
        dropped = stats.items_dropped,
        batches_failed = stats.batches_failed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "run complete"
    );
    progress.done(&stats);
    Ok(stats)
}

/// Move `urls` through the products queue and enqueue their lookups.
///
/// Returns the number of URLs no lookup could be derived from.
async fn handle_products(
    config: &RunConfig,
    services: &RunServices,
    urls: &[String],
    scheduler: &HostBatchScheduler,
    cancel: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<usize> {
    let queue = services.products.as_ref();
    let baseline = queue.handled_count().await?;
    let ceiling = (config.max_requests_per_crawl > 0)
        .then(|| config.max_requests_per_crawl + baseline);

    for url in urls {
        queue.add_request(url).await?;
    }

    let mut handled = baseline;
    let mut current = 0;
    let mut failed = 0;
    loop {
        if cancel.is_cancelled() {
            warn!(handled = current, "cancelled, no further product requests");
            break;
        }
        if let Some(ceiling) = ceiling {
            if handled >= ceiling {
                info!(ceiling, "request ceiling reached");
                break;
            }
        }
        let Some(url) = queue.fetch_next().await? else {
            break;
        };

        match lookup_request(&url) {
            Ok(request) => scheduler.enqueue(request),
            Err(e) => {
                warn!(%url, error = %e, "failed to handle product URL");
                failed += 1;
                services
                    .sink
                    .push_item(json!({ "#failed": { "url": url, "error": e.to_string() } }))
                    .await?;
            }
        }
        queue.mark_handled(&url).await?;

        handled += 1;
        current += 1;
        progress.product_handled(&url, current, urls.len());
        tokio::task::yield_now().await;
    }

    Ok(failed)
}
