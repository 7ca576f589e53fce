//! Error types for catalogsync.
//!
//! Library crates use [`CatalogError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all catalogsync operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Configuration loading or validation error. Fatal at setup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while fetching a sitemap or executing a batch.
    #[error("network error: {0}")]
    Network(String),

    /// XML/JSON/URL parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Remote query failed structurally (non-success status, GraphQL error list).
    #[error("query error: {0}")]
    Query(String),

    /// Operator-supplied transform source could not be compiled.
    #[error("compile error in \"{key}\": {message}")]
    Compile { key: String, message: String },

    /// Operator-supplied transform raised an error while evaluating one item.
    #[error("transform error: {0}")]
    Transform(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CatalogError>;

impl CatalogError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a compile error for the transform stored under `key`.
    pub fn compile(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Compile {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is worth retrying (transport-level, not structural).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}
