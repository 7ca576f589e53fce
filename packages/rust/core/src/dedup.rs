//! Exactly-once emission: the persisted processed-id set and the buffered
//! writer in front of the sink.

use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use catalogsync_shared::{CatalogError, KeyValueStore, Result, Sink};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Key of the processed-id mapping in the key-value store.
pub const PROCESSED_IDS_KEY: &str = "PROCESSED_IDS";

/// Key of the run summary in the key-value store.
pub const STATS_KEY: &str = "STATS";

// ---------------------------------------------------------------------------
// ProcessedIdSet
// ---------------------------------------------------------------------------

/// Canonical ids already emitted, within this run and by earlier runs.
#[derive(Debug, Default)]
pub struct ProcessedIdSet {
    ids: Mutex<HashSet<String>>,
}

impl ProcessedIdSet {
    /// Load the set persisted under [`PROCESSED_IDS_KEY`]; empty when absent.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self> {
        let ids: HashSet<String> = match store.get_value(PROCESSED_IDS_KEY).await? {
            Some(Value::Object(map)) => map.into_iter().map(|(id, _)| id).collect(),
            Some(Value::Null) | None => HashSet::new(),
            Some(other) => {
                return Err(CatalogError::Storage(format!(
                    "{PROCESSED_IDS_KEY} is not an object: {other}"
                )));
            }
        };
        info!(count = ids.len(), "loaded processed ids");
        Ok(Self {
            ids: Mutex::new(ids),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` iff `id` has not been emitted yet.
    pub fn should_emit(&self, id: &str) -> bool {
        !self.lock().contains(id)
    }

    /// Check and mark `id` in one step. Returns `false` if it was already
    /// marked, so concurrent batches resolving the same product emit it once.
    pub fn try_claim(&self, id: &str) -> bool {
        self.lock().insert(id.to_string())
    }

    /// Undo a claim whose emission failed.
    pub fn release(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// `{ id: true }` for every marked id.
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .lock()
            .iter()
            .map(|id| (id.clone(), Value::Bool(true)))
            .collect();
        Value::Object(map)
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        let value = self.to_value();
        store.set_value(PROCESSED_IDS_KEY, &value).await?;
        debug!(count = self.len(), "saved processed ids");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OutputBuffer
// ---------------------------------------------------------------------------

/// Records of one claimed product, waiting to be written.
#[derive(Debug)]
struct PendingProduct {
    id: String,
    records: Vec<Value>,
}

/// Batches records before writing them to the sink.
///
/// Every product's records are buffered together with its claim in the
/// [`ProcessedIdSet`]. A failed write releases the claim of every product in
/// the chunk, so a later run emits them again. With buffering disabled every
/// product is written on its own. [`flush`] must be called once at the end
/// of a run.
///
/// [`flush`]: OutputBuffer::flush
pub struct OutputBuffer {
    sink: Arc<dyn Sink>,
    processed: Arc<ProcessedIdSet>,
    capacity: usize,
    enabled: bool,
    pending: Mutex<Pending>,
    written: AtomicUsize,
    dropped: AtomicUsize,
}

#[derive(Debug, Default)]
struct Pending {
    products: Vec<PendingProduct>,
    records: usize,
}

impl OutputBuffer {
    pub fn new(
        sink: Arc<dyn Sink>,
        processed: Arc<ProcessedIdSet>,
        capacity: usize,
        enabled: bool,
    ) -> Self {
        Self {
            sink,
            processed,
            capacity: capacity.max(1),
            enabled,
            pending: Mutex::new(Pending::default()),
            written: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append the records of the product claimed as `id`; writes the whole
    /// buffer once it holds `capacity` records.
    ///
    /// On a failed write the claims of the written chunk are released and
    /// the sink error is returned.
    pub async fn push(&self, id: &str, records: Vec<Value>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let product = PendingProduct {
            id: id.to_string(),
            records,
        };
        if !self.enabled {
            return self.write(vec![product]).await;
        }

        let full = {
            let mut pending = self.lock();
            pending.records += product.records.len();
            pending.products.push(product);
            (pending.records >= self.capacity).then(|| mem::take(&mut *pending).products)
        };
        match full {
            Some(chunk) => self.write(chunk).await,
            None => Ok(()),
        }
    }

    /// Write everything still buffered.
    pub async fn flush(&self) -> Result<()> {
        let chunk = mem::take(&mut *self.lock()).products;
        if chunk.is_empty() {
            return Ok(());
        }
        self.write(chunk).await
    }

    async fn write(&self, chunk: Vec<PendingProduct>) -> Result<()> {
        let mut ids = Vec::with_capacity(chunk.len());
        let mut records = Vec::new();
        for product in chunk {
            ids.push(product.id);
            records.extend(product.records);
        }
        let n = records.len();

        match self.sink.push_items(records).await {
            Ok(()) => {
                self.written.fetch_add(n, Ordering::SeqCst);
                debug!(count = n, "flushed output buffer");
                Ok(())
            }
            Err(e) => {
                for id in &ids {
                    self.processed.release(id);
                }
                self.dropped.fetch_add(n, Ordering::SeqCst);
                warn!(records = n, products = ids.len(), error = %e, "sink write failed, claims released");
                Err(e)
            }
        }
    }

    /// Records currently held in memory.
    pub fn buffered(&self) -> usize {
        self.lock().records
    }

    /// Records written to the sink so far.
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    /// Records lost to failed sink writes.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}
