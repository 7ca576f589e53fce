//! Transform pipeline compilation and execution.
//!
//! A [`CompiledTransform`] runs `map → filter → user function → output` for
//! one data item. The map and user function results are fanned out (a
//! non-array value is a one-element sequence), filtering applies to each
//! mapped element, and every non-null output reaches the output stage in
//! the order it was produced.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use catalogsync_shared::{CatalogError, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::eval;
use crate::parser::{Function, parse_function};

/// Base map stage: `(data, context) → mapped`.
pub type MapFn = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;

/// Base filter stage: `(data, mapped element) → keep`.
pub type FilterFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Final stage receiving every output together with the merged context.
#[async_trait]
pub trait TransformOutput: Send + Sync {
    async fn output(&self, output: Value, context: &Value) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects the stages of a transform before compiling it.
pub struct TransformBuilder {
    key: String,
    source: Option<String>,
    map: Option<MapFn>,
    filter: Option<FilterFn>,
    output: Option<Arc<dyn TransformOutput>>,
    helpers: Map<String, Value>,
}

impl TransformBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            source: None,
            map: None,
            filter: None,
            output: None,
            helpers: Map::new(),
        }
    }

    /// Operator source; absent or blank means identity on `item`.
    pub fn source(mut self, source: Option<&str>) -> Self {
        self.source = source.map(str::to_string);
        self
    }

    pub fn map<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.map = Some(Arc::new(f));
        self
    }

    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(f));
        self
    }

    pub fn output(mut self, output: Arc<dyn TransformOutput>) -> Self {
        self.output = Some(output);
        self
    }

    /// Expose `value` to every invocation under `name`.
    pub fn helper(mut self, name: impl Into<String>, value: Value) -> Self {
        self.helpers.insert(name.into(), value);
        self
    }

    /// Compile the operator source. Fails with [`CatalogError::Compile`]
    /// naming the key when the source is not a single-expression function.
    pub fn compile(self) -> Result<CompiledTransform> {
        let user_fn = match self.source.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(source) => Some(
                parse_function(source).map_err(|message| CatalogError::compile(&self.key, message))?,
            ),
        };
        debug!(key = %self.key, identity = user_fn.is_none(), "compiled transform");

        Ok(CompiledTransform {
            key: self.key,
            map_fn: self.map,
            filter_fn: self.filter,
            user_fn,
            output_fn: self.output,
            helpers: self.helpers,
        })
    }
}

// ---------------------------------------------------------------------------
// CompiledTransform
// ---------------------------------------------------------------------------

/// An immutable, compiled transform. Cheap to share behind an `Arc`.
pub struct CompiledTransform {
    key: String,
    map_fn: Option<MapFn>,
    filter_fn: Option<FilterFn>,
    user_fn: Option<Function>,
    output_fn: Option<Arc<dyn TransformOutput>>,
    helpers: Map<String, Value>,
}

impl fmt::Debug for CompiledTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledTransform")
            .field("key", &self.key)
            .field("identity", &self.user_fn.is_none())
            .finish_non_exhaustive()
    }
}

impl CompiledTransform {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `true` when no operator source was supplied.
    pub fn is_identity(&self) -> bool {
        self.user_fn.is_none()
    }

    /// Run every stage for `data`, handing each output to the output stage.
    ///
    /// Returns the number of outputs produced. Without an output stage the
    /// outputs are discarded.
    pub async fn run(&self, data: &Value, extra: &Value) -> Result<usize> {
        let base = self.base_context(extra);
        let mut produced = 0;

        for element in self.mapped(data, &base)? {
            let Some(ctx) = self.item_context(&base, data, &element) else {
                continue;
            };
            for output in self.user_outputs(&ctx, element)? {
                produced += 1;
                if let Some(sink) = &self.output_fn {
                    sink.output(output, &ctx).await?;
                }
            }
        }

        Ok(produced)
    }

    /// Run the map, filter and user stages and return the outputs.
    pub fn evaluate(&self, data: &Value, extra: &Value) -> Result<Vec<Value>> {
        let base = self.base_context(extra);
        let mut outputs = Vec::new();

        for element in self.mapped(data, &base)? {
            let Some(ctx) = self.item_context(&base, data, &element) else {
                continue;
            };
            outputs.extend(self.user_outputs(&ctx, element)?);
        }

        Ok(outputs)
    }

    /// `{ ...helpers, ...extra }`
    fn base_context(&self, extra: &Value) -> Map<String, Value> {
        let mut base = self.helpers.clone();
        if let Value::Object(extra) = extra {
            base.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        base
    }

    fn mapped(&self, data: &Value, base: &Map<String, Value>) -> Result<Vec<Value>> {
        let mapped = match &self.map_fn {
            Some(map) => map(data, &Value::Object(base.clone()))?,
            None => data.clone(),
        };
        Ok(fan_out(mapped))
    }

    /// Merged context for one mapped element, or `None` when it is filtered out.
    fn item_context(&self, base: &Map<String, Value>, data: &Value, element: &Value) -> Option<Value> {
        if let Some(filter) = &self.filter_fn {
            if !filter(data, element) {
                return None;
            }
        }
        let mut ctx = base.clone();
        ctx.insert("data".into(), data.clone());
        ctx.insert("item".into(), element.clone());
        Some(Value::Object(ctx))
    }

    fn user_outputs(&self, ctx: &Value, element: Value) -> Result<Vec<Value>> {
        let result = match &self.user_fn {
            Some(function) => eval::call(function, ctx)?,
            None => element,
        };
        Ok(fan_out(result).into_iter().filter(|v| !v.is_null()).collect())
    }
}

/// A non-array value is a one-element sequence.
fn fan_out(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
