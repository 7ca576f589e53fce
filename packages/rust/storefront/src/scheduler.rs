//! Per-origin adaptive batching of product lookups.
//!
//! Each origin owns a [`HostBatchState`]. Lookups accumulate in its pending
//! queue and are released as batches of at most `batch_size`, either as soon
//! as a full batch is available or when the debounce timer fires. At most
//! `per_host_concurrency` batches per origin are in flight at once. When a
//! batch completes, its task submits the next batch for the same origin as a
//! new tracked task, so the drain chain never grows a call stack.
//!
//! All state mutation happens under one short-lived lock that is never held
//! across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use catalogsync_shared::{ProductLookupRequest, Result, StorefrontSettings};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, instrument};

use crate::query::ResolvedProduct;

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Resolves one batch of lookups for an origin.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn resolve(
        &self,
        origin: &str,
        requests: &[ProductLookupRequest],
    ) -> Result<Vec<ResolvedProduct>>;
}

/// Receives the products of every successful batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, origin: &str, products: Vec<ResolvedProduct>);
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Batching limits, taken from [`StorefrontSettings`].
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub per_host_concurrency: usize,
    pub flush_interval: Duration,
}

impl From<&StorefrontSettings> for SchedulerSettings {
    fn from(s: &StorefrontSettings) -> Self {
        Self {
            batch_size: s.batch_size.max(1),
            per_host_concurrency: s.per_host_concurrency.max(1),
            flush_interval: s.flush_interval,
        }
    }
}

/// Batching state of one origin.
#[derive(Debug, Default)]
pub struct HostBatchState {
    pending: VecDeque<ProductLookupRequest>,
    active_batches: usize,
    timer_armed: bool,
}

impl HostBatchState {
    fn has_capacity(&self, settings: &SchedulerSettings) -> bool {
        self.active_batches < settings.per_host_concurrency
    }

    /// Take up to `batch_size` oldest requests and count them as in flight.
    fn take_batch(&mut self, settings: &SchedulerSettings) -> Option<Vec<ProductLookupRequest>> {
        if self.pending.is_empty() || !self.has_capacity(settings) {
            return None;
        }
        let n = self.pending.len().min(settings.batch_size);
        self.active_batches += 1;
        Some(self.pending.drain(..n).collect())
    }
}

/// Batch counters reported when the scheduler finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub batches_succeeded: usize,
    pub batches_failed: usize,
}

// ---------------------------------------------------------------------------
// HostBatchScheduler
// ---------------------------------------------------------------------------

struct Inner {
    executor: Arc<dyn BatchExecutor>,
    handler: Arc<dyn BatchHandler>,
    settings: SchedulerSettings,
    hosts: Mutex<HashMap<String, HostBatchState>>,
    tracker: TaskTracker,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// Registry of per-origin batch states. Construct one per run.
#[derive(Clone)]
pub struct HostBatchScheduler {
    inner: Arc<Inner>,
}

impl HostBatchScheduler {
    pub fn new(
        settings: SchedulerSettings,
        executor: Arc<dyn BatchExecutor>,
        handler: Arc<dyn BatchHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                handler,
                settings,
                hosts: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                succeeded: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue one lookup on its origin.
    ///
    /// Drains immediately when a full batch is pending and the origin has
    /// spare capacity; otherwise makes sure a debounce timer is armed.
    pub fn enqueue(&self, request: ProductLookupRequest) {
        let inner = &self.inner;
        let settings = inner.settings;
        let origin = request.origin.clone();

        let batch = {
            let mut hosts = inner.lock_hosts();
            let state = hosts.entry(origin.clone()).or_default();
            state.pending.push_back(request);

            if state.pending.len() >= settings.batch_size && state.has_capacity(&settings) {
                state.take_batch(&settings)
            } else {
                if !state.timer_armed {
                    state.timer_armed = true;
                    inner.arm_timer(origin.clone());
                }
                None
            }
        };

        if let Some(batch) = batch {
            inner.spawn_batch(origin, batch);
        }
    }

    /// Number of lookups still waiting for `origin`.
    pub fn pending(&self, origin: &str) -> usize {
        self.inner
            .lock_hosts()
            .get(origin)
            .map_or(0, |s| s.pending.len())
    }

    /// Wait for every armed timer and in-flight batch (including batches
    /// they submit) to complete.
    pub async fn finish(&self) -> SchedulerStats {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        SchedulerStats {
            batches_succeeded: self.inner.succeeded.load(Ordering::SeqCst),
            batches_failed: self.inner.failed.load(Ordering::SeqCst),
        }
    }
}

impl Inner {
    fn lock_hosts(&self) -> MutexGuard<'_, HashMap<String, HostBatchState>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_timer(self: &Arc<Self>, origin: String) {
        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::time::sleep(inner.settings.flush_interval).await;
            let batch = {
                let mut hosts = inner.lock_hosts();
                hosts.get_mut(&origin).and_then(|state| {
                    state.timer_armed = false;
                    state.take_batch(&inner.settings)
                })
            };
            if let Some(batch) = batch {
                debug!(%origin, size = batch.len(), "debounce timer released batch");
                inner.spawn_batch(origin, batch);
            }
        });
    }

    fn spawn_batch(self: &Arc<Self>, origin: String, batch: Vec<ProductLookupRequest>) {
        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            inner.run_batch(&origin, batch).await;

            let next = {
                let mut hosts = inner.lock_hosts();
                hosts.get_mut(&origin).and_then(|state| {
                    state.active_batches = state.active_batches.saturating_sub(1);
                    debug!(%origin, active = state.active_batches, "batch done");
                    state.take_batch(&inner.settings)
                })
            };
            if let Some(next) = next {
                inner.spawn_batch(origin, next);
            }
        });
    }

    #[instrument(skip_all, fields(origin = %origin, size = batch.len()))]
    async fn run_batch(&self, origin: &str, batch: Vec<ProductLookupRequest>) {
        match self.executor.resolve(origin, &batch).await {
            Ok(products) => {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
                self.handler.handle(origin, products).await;
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                let handles: Vec<&str> = batch.iter().map(|r| r.handle.as_str()).collect();
                error!(%origin, error = %e, ?handles, "batch request failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use catalogsync_shared::CatalogError;

    use super::*;

    fn request(origin: &str, handle: &str) -> ProductLookupRequest {
        ProductLookupRequest {
            origin: origin.into(),
            handle: handle.into(),
            source_url: format!("{origin}/products/{handle}"),
        }
    }

    fn settings(batch_size: usize, per_host_concurrency: usize) -> SchedulerSettings {
        SchedulerSettings {
            batch_size,
            per_host_concurrency,
            flush_interval: Duration::from_millis(300),
        }
    }

    /// Records every batch and tracks peak in-flight batches per origin.
    #[derive(Default)]
    struct RecordingExecutor {
        batches: Mutex<Vec<(String, Vec<String>)>>,
        in_flight: Mutex<HashMap<String, usize>>,
        peak: AtomicUsize,
        latency: Duration,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl BatchExecutor for RecordingExecutor {
        async fn resolve(
            &self,
            origin: &str,
            requests: &[ProductLookupRequest],
        ) -> Result<Vec<ResolvedProduct>> {
            self.batches.lock().unwrap().push((
                origin.to_string(),
                requests.iter().map(|r| r.handle.clone()).collect(),
            ));
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let n = in_flight.entry(origin.to_string()).or_default();
                *n += 1;
                self.peak.fetch_max(*n, Ordering::SeqCst);
            }
            tokio::time::sleep(self.latency).await;
            *self.in_flight.lock().unwrap().get_mut(origin).unwrap() -= 1;

            match &self.fail_with {
                Some(message) => Err(CatalogError::Query(message.clone())),
                None => Ok(Vec::new()),
            }
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchHandler for CountingHandler {
        async fn handle(&self, _origin: &str, _products: Vec<ResolvedProduct>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler(
        settings: SchedulerSettings,
        executor: &Arc<RecordingExecutor>,
        handler: &Arc<CountingHandler>,
    ) -> HostBatchScheduler {
        HostBatchScheduler::new(settings, executor.clone(), handler.clone())
    }

    fn handles(executor: &RecordingExecutor) -> Vec<Vec<String>> {
        executor
            .batches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, h)| h.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn drains_fifo() {
        let executor = Arc::new(RecordingExecutor {
            latency: Duration::from_millis(10),
            ..Default::default()
        });
        let handler = Arc::new(CountingHandler::default());
        let scheduler = scheduler(settings(2, 1), &executor, &handler);

        for h in ["a", "b", "c", "d"] {
            scheduler.enqueue(request("https://shop.example", h));
        }
        let stats = scheduler.finish().await;

        assert_eq!(handles(&executor), vec![vec!["a", "b"], vec!["c", "d"]]);
        assert_eq!(stats.batches_succeeded, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_per_host_cap() {
        let executor = Arc::new(RecordingExecutor {
            latency: Duration::from_millis(50),
            ..Default::default()
        });
        let handler = Arc::new(CountingHandler::default());
        let scheduler = scheduler(settings(1, 2), &executor, &handler);

        for i in 0..10 {
            scheduler.enqueue(request("https://shop.example", &format!("p{i}")));
        }
        let stats = scheduler.finish().await;

        assert_eq!(stats.batches_succeeded, 10);
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.pending("https://shop.example"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn origins_drain_independently() {
        let executor = Arc::new(RecordingExecutor {
            latency: Duration::from_millis(50),
            ..Default::default()
        });
        let handler = Arc::new(CountingHandler::default());
        let scheduler = scheduler(settings(1, 1), &executor, &handler);

        scheduler.enqueue(request("https://a.example", "x"));
        scheduler.enqueue(request("https://b.example", "y"));
        // Both origins are in flight at once despite a cap of one each.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(executor.batches.lock().unwrap().len(), 2);

        scheduler.finish().await;
        assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_debounce() {
        let executor = Arc::new(RecordingExecutor::default());
        let handler = Arc::new(CountingHandler::default());
        let scheduler = scheduler(settings(5, 2), &executor, &handler);

        scheduler.enqueue(request("https://shop.example", "a"));
        scheduler.enqueue(request("https://shop.example", "b"));

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert!(executor.batches.lock().unwrap().is_empty());
        assert_eq!(scheduler.pending("https://shop.example"), 2);

        scheduler.finish().await;
        assert_eq!(handles(&executor), vec![vec!["a", "b"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_dropped() {
        let executor = Arc::new(RecordingExecutor {
            fail_with: Some("boom".into()),
            ..Default::default()
        });
        let handler = Arc::new(CountingHandler::default());
        let scheduler = scheduler(settings(2, 1), &executor, &handler);

        scheduler.enqueue(request("https://shop.example", "a"));
        scheduler.enqueue(request("https://shop.example", "b"));
        scheduler.enqueue(request("https://shop.example", "c"));
        let stats = scheduler.finish().await;

        // The failure neither re-enqueues [a, b] nor blocks [c].
        assert_eq!(handles(&executor), vec![vec!["a", "b"], vec!["c"]]);
        assert_eq!(stats.batches_failed, 2);
        assert_eq!(stats.batches_succeeded, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
