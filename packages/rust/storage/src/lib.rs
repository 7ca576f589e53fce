//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the durable
//! request queues, the key-value store for run state, and the output
//! dataset. It implements the service traits of `catalogsync-shared`.
//!
//! **Access rules:**
//! - `run`: read-write via [`Storage::open`]
//! - `export`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use catalogsync_shared::{CatalogError, KeyValueStore, RequestQueue, Result, Sink};
use chrono::Utc;
use libsql::{Connection, Database, params};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

/// Dataset that [`Sink`] writes to.
pub const DEFAULT_DATASET: &str = "default";

fn storage_err(e: libsql::Error) -> CatalogError {
    CatalogError::Storage(e.to_string())
}

/// Unique key of a queued URL: hex SHA-256 of the URL.
pub fn unique_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CatalogError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CatalogError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CatalogError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Request queues
    // -----------------------------------------------------------------------

    /// Open the named request queue.
    ///
    /// Requests left in progress by an interrupted run become pending again.
    pub async fn queue(&self, name: &str) -> Result<StorageQueue> {
        self.check_writable()?;
        let reset = self
            .conn
            .execute(
                "UPDATE request_queue SET state = 'pending'
                 WHERE queue = ?1 AND state = 'in_progress'",
                params![name],
            )
            .await
            .map_err(storage_err)?;
        if reset > 0 {
            info!(queue = name, reset, "re-queued interrupted requests");
        }

        Ok(StorageQueue {
            conn: self.conn.clone(),
            name: name.to_string(),
        })
    }

    /// Remove every request of the named queue.
    pub async fn purge_queue(&self, name: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM request_queue WHERE queue = ?1", params![name])
            .await
            .map_err(storage_err)
    }

    // -----------------------------------------------------------------------
    // Dataset
    // -----------------------------------------------------------------------

    /// Items of `dataset` in insertion order.
    pub async fn list_items(&self, dataset: &str, limit: Option<usize>) -> Result<Vec<Value>> {
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let mut rows = self
            .conn
            .query(
                "SELECT item_json FROM dataset_items WHERE dataset = ?1 ORDER BY seq LIMIT ?2",
                params![dataset, limit],
            )
            .await
            .map_err(storage_err)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let json: String = row.get(0).map_err(storage_err)?;
            items.push(serde_json::from_str(&json).map_err(|e| {
                CatalogError::Storage(format!("corrupt dataset item: {e}"))
            })?);
        }
        Ok(items)
    }

    /// Number of items in `dataset`.
    pub async fn count_items(&self, dataset: &str) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM dataset_items WHERE dataset = ?1",
                params![dataset],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<u64>(0).map_err(storage_err)? as usize),
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Service trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl KeyValueStore for Storage {
    async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        let mut rows = self
            .conn
            .query("SELECT value_json FROM kv_store WHERE key = ?1", params![key])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(storage_err)?;
                let value = serde_json::from_str(&json).map_err(|e| {
                    CatalogError::Storage(format!("corrupt value for key {key}: {e}"))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO kv_store (key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json,
                                                updated_at = excluded.updated_at",
                params![key, value.to_string(), now],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl Sink for Storage {
    async fn push_items(&self, items: Vec<Value>) -> Result<()> {
        self.check_writable()?;
        if items.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();
        for item in &items {
            tx.execute(
                "INSERT INTO dataset_items (id, dataset, item_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::now_v7().to_string(),
                    DEFAULT_DATASET,
                    item.to_string(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(count = items.len(), "pushed dataset items");
        Ok(())
    }
}

/// A named durable request queue.
#[derive(Clone)]
pub struct StorageQueue {
    conn: Connection,
    name: String,
}

impl StorageQueue {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl RequestQueue for StorageQueue {
    async fn add_request(&self, url: &str) -> Result<bool> {
        let added = self
            .conn
            .execute(
                "INSERT INTO request_queue (queue, unique_key, url, added_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(queue, unique_key) DO NOTHING",
                params![
                    self.name.as_str(),
                    unique_key(url),
                    url,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(added > 0)
    }

    async fn fetch_next(&self) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "UPDATE request_queue SET state = 'in_progress'
                 WHERE id = (SELECT id FROM request_queue
                             WHERE queue = ?1 AND state = 'pending'
                             ORDER BY id LIMIT 1)
                 RETURNING url",
                params![self.name.as_str()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    async fn mark_handled(&self, url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE request_queue SET state = 'handled', handled_at = ?3
                 WHERE queue = ?1 AND unique_key = ?2",
                params![self.name.as_str(), unique_key(url), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn handled_count(&self) -> Result<usize> {
        self.count_state("handled").await
    }

    async fn pending_count(&self) -> Result<usize> {
        self.count_state("pending").await
    }
}

impl StorageQueue {
    async fn count_state(&self, state: &str) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM request_queue WHERE queue = ?1 AND state = ?2",
                params![self.name.as_str(), state],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<u64>(0).map_err(storage_err)? as usize),
            None => Ok(0),
        }
    }
}
