//! Interpreter for parsed transform functions.
//!
//! Evaluation is a pure function of the argument value: the only names in
//! scope are the ones the function's parameters bind, and the only callable
//! things are the built-in methods and helpers below. Every evaluated node
//! costs one step, and every value a node builds is charged against a byte
//! budget. Step count, allocated bytes and nesting depth are all bounded.

use std::cmp::Ordering;

use catalogsync_shared::{CatalogError, Result, strip_gid};
use regex::Regex;
use serde_json::{Map, Value};

use crate::helpers::{strip_html, strip_url_query, to_snake_case, unique_defined};
use crate::parser::{
    ArrayEntry, BinaryOp, Expr, Function, LogicalOp, ObjectEntry, Params, UnaryOp, number_value,
};

/// Maximum evaluated nodes per invocation.
pub const MAX_STEPS: usize = 100_000;

/// Maximum evaluation nesting (expressions and lambda calls).
pub const MAX_DEPTH: usize = 128;

/// Maximum bytes of values produced per invocation.
pub const MAX_ALLOC_BYTES: usize = 64 << 20;

/// Maximum length of a string built by concatenation, `join` or `split`.
const MAX_STRING_LEN: usize = 1 << 20;

/// Charged per value node on top of its string payload.
const VALUE_OVERHEAD: usize = std::mem::size_of::<Value>();

fn fail(message: impl Into<String>) -> CatalogError {
    CatalogError::Transform(message.into())
}

/// Evaluate `function` against the merged context `ctx`.
pub fn call(function: &Function, ctx: &Value) -> Result<Value> {
    let mut scope = Vec::new();
    match &function.params {
        Params::Whole(name) => scope.push((name.clone(), ctx.clone())),
        Params::Destructured(names) => {
            for name in names {
                scope.push((name.clone(), ctx.get(name).cloned().unwrap_or(Value::Null)));
            }
        }
        Params::None => {}
    }
    let mut interp = Interpreter {
        scope,
        steps: 0,
        allocated: 0,
        depth: 0,
    };
    interp.eval(&function.body)
}

struct Interpreter {
    scope: Vec<(String, Value)>,
    steps: usize,
    allocated: usize,
    depth: usize,
}

impl Interpreter {
    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        self.steps += 1;
        if self.steps > MAX_STEPS {
            return Err(fail(format!("step budget of {MAX_STEPS} exceeded")));
        }
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(fail(format!("evaluation nested deeper than {MAX_DEPTH} levels")));
        }
        let result = self.eval_inner(expr);
        self.depth -= 1;
        let value = result?;
        if builds_value(expr) {
            self.charge(value_size(&value))?;
        }
        Ok(value)
    }

    /// Record `bytes` of produced values.
    fn charge(&mut self, bytes: usize) -> Result<()> {
        self.allocated = self.allocated.saturating_add(bytes);
        self.ensure_room(0)
    }

    /// Fail before building a value of `bytes` that would exceed the budget.
    fn ensure_room(&self, bytes: usize) -> Result<()> {
        if self.allocated.saturating_add(bytes) > MAX_ALLOC_BYTES {
            return Err(fail(format!("allocation budget of {MAX_ALLOC_BYTES} bytes exceeded")));
        }
        Ok(())
    }

    fn eval_inner(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => self.lookup(name),
            Expr::Array(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        ArrayEntry::Item(e) => out.push(self.eval(e)?),
                        ArrayEntry::Spread(e) => match self.eval(e)? {
                            Value::Array(items) => out.extend(items),
                            Value::Null => {}
                            other => return Err(fail(format!("cannot spread {} into an array", type_name(&other)))),
                        },
                    }
                }
                Ok(Value::Array(out))
            }
            Expr::Object(entries) => {
                let mut out = Map::new();
                for entry in entries {
                    match entry {
                        ObjectEntry::Field(key, e) => {
                            let value = self.eval(e)?;
                            out.insert(key.clone(), value);
                        }
                        ObjectEntry::Spread(e) => match self.eval(e)? {
                            Value::Object(map) => out.extend(map),
                            Value::Null => {}
                            other => return Err(fail(format!("cannot spread {} into an object", type_name(&other)))),
                        },
                    }
                }
                Ok(Value::Object(out))
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let target = self.eval(object)?;
                if target.is_null() {
                    return if *optional {
                        Ok(Value::Null)
                    } else {
                        Err(fail(format!("cannot read property '{property}' of null")))
                    };
                }
                Ok(member(&target, property))
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let target = self.eval(object)?;
                if target.is_null() {
                    return if *optional {
                        Ok(Value::Null)
                    } else {
                        Err(fail("cannot index null"))
                    };
                }
                let index = self.eval(index)?;
                Ok(index_value(&target, &index))
            }
            Expr::MethodCall {
                object,
                method,
                args,
                optional,
            } => {
                let target = self.eval(object)?;
                if target.is_null() {
                    return if *optional {
                        Ok(Value::Null)
                    } else {
                        Err(fail(format!("cannot call '{method}' on null")))
                    };
                }
                self.method(target, method, args)
            }
            Expr::HelperCall { name, args } => self.helper(name, args),
            Expr::Lambda { .. } => Err(fail("a function can only be passed to a method")),
            Expr::Unary(op, operand) => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                    UnaryOp::Neg => Ok(number_value(-to_number(&v)?)),
                }
            }
            Expr::Binary(op, left, right) => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary(*op, &l, &r)
            }
            Expr::Logical(op, left, right) => {
                let l = self.eval(left)?;
                let short_circuit = match op {
                    LogicalOp::And => !truthy(&l),
                    LogicalOp::Or => truthy(&l),
                    LogicalOp::Nullish => !l.is_null(),
                };
                if short_circuit { Ok(l) } else { self.eval(right) }
            }
            Expr::Conditional {
                test,
                then,
                otherwise,
            } => {
                if truthy(&self.eval(test)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value> {
        self.scope
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| fail(format!("'{name}' is not defined")))
    }

    /// Call a lambda argument with positional values bound to its parameters.
    fn apply(&mut self, lambda: &Expr, values: &[Value]) -> Result<Value> {
        let Expr::Lambda { params, body } = lambda else {
            return Err(fail("expected a function argument"));
        };
        let mark = self.scope.len();
        for (i, name) in params.iter().enumerate() {
            self.scope
                .push((name.clone(), values.get(i).cloned().unwrap_or(Value::Null)));
        }
        let result = self.eval(body);
        self.scope.truncate(mark);
        result
    }

    fn arg(&mut self, args: &[Expr], i: usize) -> Result<Value> {
        match args.get(i) {
            Some(e) => self.eval(e),
            None => Ok(Value::Null),
        }
    }

    fn string_arg(&mut self, args: &[Expr], i: usize, method: &str) -> Result<String> {
        match self.arg(args, i)? {
            Value::String(s) => Ok(s),
            other => Err(fail(format!(
                "{method} expects a string argument, got {}",
                type_name(&other)
            ))),
        }
    }

    fn lambda_arg<'a>(&self, args: &'a [Expr], method: &str) -> Result<&'a Expr> {
        match args.first() {
            Some(lambda @ Expr::Lambda { .. }) => Ok(lambda),
            _ => Err(fail(format!("{method} expects a function argument"))),
        }
    }

    fn method(&mut self, target: Value, method: &str, args: &[Expr]) -> Result<Value> {
        match (target, method) {
            // -- arrays ------------------------------------------------------
            (Value::Array(items), "map") => {
                let f = self.lambda_arg(args, method)?;
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    out.push(self.apply(f, &[item, Value::from(i)])?);
                }
                Ok(Value::Array(out))
            }
            (Value::Array(items), "filter") => {
                let f = self.lambda_arg(args, method)?;
                let mut out = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    if truthy(&self.apply(f, &[item.clone(), Value::from(i)])?) {
                        out.push(item);
                    }
                }
                Ok(Value::Array(out))
            }
            (Value::Array(items), "find") => {
                let f = self.lambda_arg(args, method)?;
                for (i, item) in items.into_iter().enumerate() {
                    if truthy(&self.apply(f, &[item.clone(), Value::from(i)])?) {
                        return Ok(item);
                    }
                }
                Ok(Value::Null)
            }
            (Value::Array(items), "some" | "every") => {
                let f = self.lambda_arg(args, method)?;
                let want = method == "some";
                for (i, item) in items.into_iter().enumerate() {
                    if truthy(&self.apply(f, &[item, Value::from(i)])?) == want {
                        return Ok(Value::Bool(want));
                    }
                }
                Ok(Value::Bool(!want))
            }
            (Value::Array(items), "includes") => {
                let needle = self.arg(args, 0)?;
                Ok(Value::Bool(items.iter().any(|v| loose_eq(v, &needle))))
            }
            (Value::Array(items), "join") => {
                let sep = match self.arg(args, 0)? {
                    Value::Null => ",".to_string(),
                    v => display(&v),
                };
                let parts: Vec<String> = items
                    .iter()
                    .map(|v| if v.is_null() { String::new() } else { display(v) })
                    .collect();
                let len = parts.iter().map(String::len).sum::<usize>()
                    + sep.len().saturating_mul(parts.len().saturating_sub(1));
                if len > MAX_STRING_LEN {
                    return Err(fail("string too long"));
                }
                self.ensure_room(len)?;
                Ok(Value::String(parts.join(&sep)))
            }
            (Value::Array(items), "slice") => {
                let (start, end) = self.slice_bounds(args, items.len())?;
                Ok(Value::Array(items[start..end].to_vec()))
            }
            (Value::Array(items), "length") => Ok(Value::from(items.len())),

            // -- strings -----------------------------------------------------
            (Value::String(s), "split") => {
                let sep = self.string_arg(args, 0, method)?;
                let pieces = if sep.is_empty() {
                    s.chars().count()
                } else {
                    s.matches(sep.as_str()).count() + 1
                };
                self.ensure_room(pieces.saturating_mul(VALUE_OVERHEAD) + s.len())?;
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::String(c.to_string())).collect()
                } else {
                    s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect()
                };
                Ok(Value::Array(parts))
            }
            (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
            (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
            (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
            (Value::String(s), "startsWith") => {
                let prefix = self.string_arg(args, 0, method)?;
                Ok(Value::Bool(s.starts_with(&prefix)))
            }
            (Value::String(s), "endsWith") => {
                let suffix = self.string_arg(args, 0, method)?;
                Ok(Value::Bool(s.ends_with(&suffix)))
            }
            (Value::String(s), "includes") => {
                let needle = self.string_arg(args, 0, method)?;
                Ok(Value::Bool(s.contains(&needle)))
            }
            (Value::String(s), "replace") => {
                let from = self.string_arg(args, 0, method)?;
                let to = self.string_arg(args, 1, method)?;
                Ok(Value::String(s.replacen(&from, &to, 1)))
            }
            (Value::String(s), "slice") => {
                let chars: Vec<char> = s.chars().collect();
                let (start, end) = self.slice_bounds(args, chars.len())?;
                Ok(Value::String(chars[start..end].iter().collect()))
            }
            (Value::String(s), "length") => Ok(Value::from(s.chars().count())),

            (other, _) => Err(fail(format!(
                "{} has no method '{method}'",
                type_name(&other)
            ))),
        }
    }

    /// JS-style `slice(start, end)` bounds: negatives count from the end.
    fn slice_bounds(&mut self, args: &[Expr], len: usize) -> Result<(usize, usize)> {
        let resolve = |v: Value, default: usize| -> Result<usize> {
            if v.is_null() {
                return Ok(default);
            }
            let n = to_number(&v)?.trunc();
            let len_f = len as f64;
            let idx = if n < 0.0 { (len_f + n).max(0.0) } else { n.min(len_f) };
            Ok(idx as usize)
        };
        let start = resolve(self.arg(args, 0)?, 0)?;
        let end = resolve(self.arg(args, 1)?, len)?;
        Ok((start, end.max(start)))
    }

    fn helper(&mut self, name: &str, args: &[Expr]) -> Result<Value> {
        match name {
            "stripHtml" => Ok(Value::String(strip_html(&self.display_arg(args)?))),
            "stripUrlQuery" => Ok(Value::String(strip_url_query(&self.display_arg(args)?))),
            "toSnakeCase" => Ok(Value::String(to_snake_case(&self.display_arg(args)?))),
            "stripGid" => Ok(Value::String(strip_gid(&self.display_arg(args)?))),
            "uniqueDefined" => match self.arg(args, 0)? {
                Value::Array(items) => Ok(Value::Array(unique_defined(&items))),
                Value::Null => Ok(Value::Array(Vec::new())),
                other => Err(fail(format!("uniqueDefined expects an array, got {}", type_name(&other)))),
            },
            "keys" => match self.arg(args, 0)? {
                Value::Object(map) => Ok(Value::Array(map.keys().cloned().map(Value::String).collect())),
                _ => Ok(Value::Array(Vec::new())),
            },
            "values" => match self.arg(args, 0)? {
                Value::Object(map) => Ok(Value::Array(map.into_iter().map(|(_, v)| v).collect())),
                _ => Ok(Value::Array(Vec::new())),
            },
            "matches" => {
                let subject = self.display_arg(args)?;
                let pattern = self.string_arg(args, 1, name)?;
                let re = Regex::new(&pattern)
                    .map_err(|e| fail(format!("invalid pattern {pattern:?}: {e}")))?;
                Ok(Value::Bool(re.is_match(&subject)))
            }
            "number" => match self.arg(args, 0)? {
                Value::Null => Ok(Value::Null),
                v => Ok(to_number(&v).ok().filter(|n| n.is_finite()).map_or(Value::Null, number_value)),
            },
            "string" => match self.arg(args, 0)? {
                Value::Null => Ok(Value::String(String::new())),
                v => Ok(Value::String(display(&v))),
            },
            "now" => Ok(Value::String(chrono::Utc::now().to_rfc3339())),
            _ => Err(fail(format!("unknown helper '{name}'"))),
        }
    }

    /// First argument as display text; null becomes the empty string.
    fn display_arg(&mut self, args: &[Expr]) -> Result<String> {
        Ok(match self.arg(args, 0)? {
            Value::Null => String::new(),
            v => display(&v),
        })
    }
}

// ---------------------------------------------------------------------------
// Value semantics
// ---------------------------------------------------------------------------

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Expressions whose result is newly built rather than read from scope.
fn builds_value(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Array(_)
            | Expr::Object(_)
            | Expr::MethodCall { .. }
            | Expr::HelperCall { .. }
            | Expr::Binary(..)
            | Expr::Unary(..)
    )
}

/// Approximate heap footprint of `v`.
fn value_size(v: &Value) -> usize {
    VALUE_OVERHEAD
        + match v {
            Value::String(s) => s.len(),
            Value::Array(items) => items.iter().map(value_size).sum(),
            Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
            _ => 0,
        }
}

/// JavaScript truthiness.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used for concatenation and `join`.
fn display(v: &Value) -> String {
    match v {
        Value::Null => "null".into(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|v| if v.is_null() { String::new() } else { display(v) })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".into(),
    }
}

fn to_number(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => n.as_f64().ok_or_else(|| fail("number out of range")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| fail(format!("{s:?} is not a number"))),
        other => Err(fail(format!("{} is not a number", type_name(other)))),
    }
}

fn member(target: &Value, property: &str) -> Value {
    match (target, property) {
        (Value::Object(map), _) => map.get(property).cloned().unwrap_or(Value::Null),
        (Value::Array(items), "length") => Value::from(items.len()),
        (Value::String(s), "length") => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::String(s), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map_or(Value::Null, |c| Value::String(c.to_string())),
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        (_, Value::String(key)) => member(target, key),
        _ => Value::Null,
    }
}

/// Equality with numeric normalisation (`1 == 1.0`).
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => {
            let (x, y) = (to_number(a)?, to_number(b)?);
            x.partial_cmp(&y).ok_or_else(|| fail("cannot compare NaN"))
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinaryOp::Add => match (l, r) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                let s = display(l) + &display(r);
                if s.len() > MAX_STRING_LEN {
                    return Err(fail("string too long"));
                }
                Ok(Value::String(s))
            }
            (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
                Err(fail(format!("cannot add {} and {}", type_name(l), type_name(r))))
            }
            _ => Ok(number_value(to_number(l)? + to_number(r)?)),
        },
        BinaryOp::Sub => Ok(number_value(to_number(l)? - to_number(r)?)),
        BinaryOp::Mul => Ok(number_value(to_number(l)? * to_number(r)?)),
        BinaryOp::Div => Ok(number_value(to_number(l)? / to_number(r)?)),
        BinaryOp::Rem => Ok(number_value(to_number(l)? % to_number(r)?)),
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt => Ok(Value::Bool(compare(l, r)? == Ordering::Less)),
        BinaryOp::LtEq => Ok(Value::Bool(compare(l, r)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(l, r)? == Ordering::Greater)),
        BinaryOp::GtEq => Ok(Value::Bool(compare(l, r)? != Ordering::Less)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::parser::parse_function;

    fn run(source: &str, ctx: Value) -> Result<Value> {
        call(&parse_function(source).unwrap(), &ctx)
    }

    #[test]
    fn binds_destructured_and_whole_context() {
        let ctx = json!({"item": {"title": "Hat"}, "data": 1});
        assert_eq!(run("({ item }) => item.title", ctx.clone()).unwrap(), json!("Hat"));
        assert_eq!(run("(ctx) => ctx.data + 1", ctx.clone()).unwrap(), json!(2));
        assert_eq!(run("({ missing }) => missing ?? 'x'", ctx).unwrap(), json!("x"));
    }

    #[test]
    fn builds_objects_and_arrays() {
        let ctx = json!({"item": {"id": "1", "tags": ["a", "b"]}});
        assert_eq!(
            run("({ item }) => ({ ...item, tags: [...item.tags, 'c'], n: item.tags.length })", ctx)
                .unwrap(),
            json!({"id": "1", "tags": ["a", "b", "c"], "n": 2})
        );
    }

    #[test]
    fn array_methods() {
        let ctx = json!({"item": {"variants": [{"sku": "A", "price": 5}, {"sku": "B", "price": 15}]}});
        assert_eq!(
            run("({ item }) => item.variants.filter(v => v.price > 10).map(v => v.sku)", ctx.clone())
                .unwrap(),
            json!(["B"])
        );
        assert_eq!(
            run("({ item }) => item.variants.find(v => v.sku == 'A').price", ctx.clone()).unwrap(),
            json!(5)
        );
        assert_eq!(
            run("({ item }) => [item.variants.some(v => v.price > 10), item.variants.every(v => v.price > 10)]", ctx.clone()).unwrap(),
            json!([true, false])
        );
        assert_eq!(
            run("({ item }) => item.variants.map((v, i) => i + ':' + v.sku).join('|')", ctx).unwrap(),
            json!("0:A|1:B")
        );
    }

    #[test]
    fn string_methods_and_helpers() {
        let ctx = json!({"item": {"title": "  Red Shirt ", "html": "<p>Hi</p>", "id": "gid://shopify/Product/9"}});
        assert_eq!(
            run("({ item }) => item.title.trim().toLowerCase().split(' ').join('-')", ctx.clone()).unwrap(),
            json!("red-shirt")
        );
        assert_eq!(run("({ item }) => stripHtml(item.html)", ctx.clone()).unwrap(), json!("Hi"));
        assert_eq!(run("({ item }) => stripGid(item.id)", ctx.clone()).unwrap(), json!("9"));
        assert_eq!(
            run("({ item }) => matches(item.title, '^\\\\s+Red')", ctx.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(run("() => number('12.50') * 2", Value::Null).unwrap(), json!(25));
        assert_eq!(run("() => 'abcdef'.slice(1, -2)", Value::Null).unwrap(), json!("bcd"));
        assert_eq!(run("() => [1, 2, 3].slice(-2)", Value::Null).unwrap(), json!([2, 3]));
    }

    #[test]
    fn optional_chaining_and_ternary() {
        let ctx = json!({"item": {"image": null}});
        assert_eq!(run("({ item }) => item.image?.src", ctx.clone()).unwrap(), Value::Null);
        assert_eq!(
            run("({ item }) => item.image ? 'yes' : 'no'", ctx.clone()).unwrap(),
            json!("no")
        );
        let err = run("({ item }) => item.image.src", ctx).unwrap_err();
        assert!(err.to_string().contains("cannot read property 'src'"));
    }

    #[test]
    fn no_ambient_names() {
        for source in ["() => process", "() => require('fs')", "() => env.HOME", "() => fetch('x')"] {
            assert!(
                matches!(run(source, json!({})), Err(CatalogError::Transform(_))),
                "{source} should fail"
            );
        }
    }

    #[test]
    fn step_budget_is_enforced() {
        // Each level of nesting multiplies the work by the array size.
        let range: String = format!("[{}]", vec!["0"; 100].join(","));
        let source = format!("() => {range}.map(a => {range}.map(b => {range}.map(c => a + b + c)))");
        let err = run(&source, Value::Null).unwrap_err();
        assert!(err.to_string().contains("step budget"));
    }

    #[test]
    fn allocation_budget_is_enforced() {
        // Eight nested maps give 256 copies of a 4 KiB string per outer element.
        let mut body = format!("'{}'", "x".repeat(4096));
        for i in 0..8 {
            body = format!("[0, 0].map(a{i} => {body})");
        }
        let outer = format!("[{}]", vec!["0"; 200].join(","));
        let source = format!("() => {outer}.map(n => {body}).join('')");

        let err = run(&source, Value::Null).unwrap_err();
        assert!(matches!(err, CatalogError::Transform(_)));
        assert!(err.to_string().contains("allocation budget"), "{err}");
    }

    #[test]
    fn join_and_split_respect_string_cap() {
        let chunk = "y".repeat(4096);
        let copies = format!("[{}]", vec![format!("'{chunk}'"); 300].join(","));
        let err = run(&format!("() => {copies}.join('')"), Value::Null).unwrap_err();
        assert!(err.to_string().contains("string too long"));

        let err = run(&format!("() => {copies}.join('{}')", "z".repeat(8192)), Value::Null)
            .unwrap_err();
        assert!(err.to_string().contains("string too long"));

        assert_eq!(
            run("() => 'a,b'.split(',').join('+')", Value::Null).unwrap(),
            json!("a+b")
        );
    }

    #[test]
    fn ordinary_transforms_stay_within_budget() {
        let variants: Vec<Value> = (0..500)
            .map(|i| json!({"sku": format!("SKU-{i}"), "title": "Variant title", "price": i}))
            .collect();
        let ctx = json!({"item": {"title": "Shirt", "variants": variants}});
        let out = run(
            "({ item }) => item.variants.map(v => ({ ...v, label: item.title + ' / ' + v.sku }))",
            ctx,
        )
        .unwrap();
        assert_eq!(out.as_array().map(Vec::len), Some(500));
    }

    #[test]
    fn type_errors_are_runtime_failures() {
        assert!(run("() => ({}) + 1", Value::Null).is_err());
        assert!(run("() => 'x'.nope()", Value::Null).is_err());
        assert!(run("() => [1].map(1)", Value::Null).is_err());
    }
}
