//! Storefront product resolution.
//!
//! This crate provides:
//! - [`lookup_request`]: product URL → origin + handle
//! - [`build_batch_query`] / [`demultiplex`]: one aggregated query per batch
//! - [`StorefrontClient`]: executes batch queries over HTTP
//! - [`HostBatchScheduler`]: per-origin batching with a debounce interval

mod client;
mod handle;
mod query;
mod scheduler;

pub use client::StorefrontClient;
pub use handle::lookup_request;
pub use query::{BatchQuery, ResolvedProduct, build_batch_query, demultiplex};
pub use scheduler::{
    BatchExecutor, BatchHandler, HostBatchScheduler, HostBatchState, SchedulerSettings,
    SchedulerStats,
};
