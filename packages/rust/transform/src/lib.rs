//! Operator-extensible transform pipeline.
//!
//! Operator sources are single-expression arrow functions such as
//! `({ item, customData }) => ({ ...item, source: customData.name })`,
//! compiled once per key into a [`CompiledTransform`] and evaluated by a
//! closed interpreter over JSON values. The interpreter has no ambient state:
//! only the names bound by the function's parameter are visible, and
//! evaluation is bounded by a step budget, a byte budget and a nesting limit.

mod eval;
mod lexer;
mod parser;
mod pipeline;

pub mod helpers;

pub use eval::{MAX_ALLOC_BYTES, MAX_DEPTH, MAX_STEPS, truthy};
pub use pipeline::{CompiledTransform, FilterFn, MapFn, TransformBuilder, TransformOutput};
