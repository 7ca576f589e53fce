//! Core pipeline orchestration for catalogsync.
//!
//! This crate ties together sitemap discovery, batched storefront lookups,
//! operator transforms, and exactly-once output into one `run` workflow.

pub mod dedup;
pub mod pipeline;
pub mod record;

pub use dedup::{OutputBuffer, PROCESSED_IDS_KEY, ProcessedIdSet, STATS_KEY};
pub use pipeline::{ProgressReporter, RunServices, SilentProgress, run};
pub use record::{map_to_record, variant_attributes};
