//! Trait definitions for external collaborators.
//!
//! The pipeline never reaches a concrete backend directly: the durable request
//! queue, the key-value store for run state, and the output sink are consumed
//! through these traits. `catalogsync-storage` provides the libSQL backend;
//! tests provide in-memory fakes.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Durable, deduplicating queue of URLs to fetch.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Schedule `url`. Returns `false` if the queue already knew it.
    async fn add_request(&self, url: &str) -> Result<bool>;

    /// Next pending URL, oldest first. It stays in progress, and is not
    /// returned again, until [`RequestQueue::mark_handled`] is called.
    async fn fetch_next(&self) -> Result<Option<String>>;

    /// Mark `url` as handled (fetched or abandoned).
    async fn mark_handled(&self, url: &str) -> Result<()>;

    /// Number of handled requests, used as the baseline of the request ceiling.
    async fn handled_count(&self) -> Result<usize>;

    /// Number of pending requests. Unlike [`RequestQueue::fetch_next`] this
    /// takes nothing off the queue.
    async fn pending_count(&self) -> Result<usize>;
}

/// Named JSON values persisted between runs.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<Value>>;

    async fn set_value(&self, key: &str, value: &Value) -> Result<()>;
}

/// Append-only destination for output records.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn push_item(&self, item: Value) -> Result<()> {
        self.push_items(vec![item]).await
    }

    async fn push_items(&self, items: Vec<Value>) -> Result<()>;
}
