//! Shared types, error model, configuration, and service traits for catalogsync.
//!
//! This crate is the foundation depended on by all other catalogsync crates.
//! It provides:
//! - [`CatalogError`]: the unified error type
//! - Domain types ([`SitemapEntry`], [`ProductLookupRequest`], [`CanonicalProduct`], [`OutputItem`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)
//! - Service traits for the queue, key-value store, and sink ([`services`])

pub mod config;
pub mod error;
pub mod services;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlSection, OutputSection, RunConfig, RunOverrides, StartUrl,
    StorefrontSection, StorefrontSettings, TransformSection, WalkSettings, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{CatalogError, Result};
pub use services::{KeyValueStore, RequestQueue, Sink};
pub use types::{
    AdditionalInfo, CanonicalProduct, OutputItem, ProductImage, ProductLookupRequest,
    ProductOption, ProductVariant, RunStats, SitemapEntry, VariantSummary, parse_date, strip_gid,
};
