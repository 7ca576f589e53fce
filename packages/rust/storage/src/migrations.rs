//! SQL migration definitions for the catalogsync database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: request_queue, kv_store, dataset_items",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Durable request queues, deduplicated by (queue, unique_key).
-- state: pending | in_progress | handled
CREATE TABLE IF NOT EXISTS request_queue (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    queue      TEXT NOT NULL,
    unique_key TEXT NOT NULL,
    url        TEXT NOT NULL,
    state      TEXT NOT NULL DEFAULT 'pending',
    added_at   TEXT NOT NULL,
    handled_at TEXT,
    UNIQUE(queue, unique_key)
);

CREATE INDEX IF NOT EXISTS idx_request_queue_state ON request_queue(queue, state, id);

-- Named JSON values persisted between runs
CREATE TABLE IF NOT EXISTS kv_store (
    key        TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Append-only output records
CREATE TABLE IF NOT EXISTS dataset_items (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,
    dataset    TEXT NOT NULL,
    item_json  TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_dataset_items_dataset ON dataset_items(dataset, seq);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
