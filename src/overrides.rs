//! Transform Middleware: declarative body/header override operations
//! applied to the outbound raw request.
//!
//! Applies a sequential `Value` mutation over an ordered list of typed
//! ops, generalized from fixed per-provider JSON patches into a
//! declarative op algebra that config can express directly. Condition and
//! value templates render through `minijinja`, a minimal Jinja2-flavored
//! text-template engine: a context object renders to a string through a
//! documented, small function set.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::warn;

/// Legacy sentinel value meaning "delete this path" when it appears as a
/// literal map value or as a rendered `set` value.
pub const CLEAR_SENTINEL: &str = "__AXONHUB_CLEAR__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideOp {
    Set {
        path: String,
        value: String,
        condition: Option<String>,
    },
    Delete {
        path: String,
        condition: Option<String>,
    },
    Rename {
        from: String,
        to: String,
        condition: Option<String>,
    },
    Copy {
        from: String,
        to: String,
        condition: Option<String>,
    },
}

impl OverrideOp {
    /// The path this op would ultimately *write* to, used for the `stream`
    /// suppression guard; `None` for delete-only ops that don't write.
    fn write_path(&self) -> &str {
        match self {
            OverrideOp::Set { path, .. } => path,
            OverrideOp::Delete { path, .. } => path,
            OverrideOp::Rename { to, .. } => to,
            OverrideOp::Copy { to, .. } => to,
        }
    }

    fn condition(&self) -> Option<&str> {
        match self {
            OverrideOp::Set { condition, .. }
            | OverrideOp::Delete { condition, .. }
            | OverrideOp::Rename { condition, .. }
            | OverrideOp::Copy { condition, .. } => condition.as_deref(),
        }
    }
}

/// Render context for condition/value templates: the request's resolved
/// model name, the canonical `model` field, an opaque metadata blob, and
/// the reasoning-effort hint if present.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub request_model: String,
    pub model: String,
    pub metadata: Value,
    pub reasoning_effort: Option<String>,
}

impl RenderContext {
    fn minijinja_context(&self) -> minijinja::Value {
        minijinja::context! {
            request_model => self.request_model.clone(),
            model => self.model.clone(),
            metadata => self.metadata.clone(),
            reasoning_effort => self.reasoning_effort.clone(),
        }
    }
}

/// Renders `template` against `ctx`; on parse/execute error, logs and falls
/// back to the literal text unchanged.
fn render_template(template: &str, ctx: &RenderContext) -> String {
    if !template.contains("{{") && !template.contains("{%") {
        return template.to_string();
    }
    let env = minijinja::Environment::new();
    match env.render_str(template, ctx.minijinja_context()) {
        Ok(rendered) => rendered,
        Err(err) => {
            warn!(template, error = %err, "override template render failed, using literal");
            template.to_string()
        }
    }
}

/// `condition` renders to exactly `"true"` (after trimming) to hold; an
/// absent or blank condition always holds.
fn condition_holds(condition: Option<&str>, ctx: &RenderContext) -> bool {
    match condition {
        None => true,
        Some(c) if c.trim().is_empty() => true,
        Some(c) => render_template(c, ctx).trim() == "true",
    }
}

/// JSON auto-coercion: a rendered string is decoded as JSON only when its
/// first non-whitespace character is one of `{[-`, a digit, or the whole
/// trimmed text equals `true`/`false`/`null`; otherwise it is kept as a
/// raw string. Decode failure also falls back to the raw string.
fn decode_or_literal(rendered: &str) -> Value {
    let trimmed = rendered.trim();
    let looks_json = trimmed == "true"
        || trimmed == "false"
        || trimmed == "null"
        || matches!(trimmed.chars().next(), Some(c) if c == '{' || c == '[' || c == '-' || c.is_ascii_digit());

    if looks_json {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return value;
        }
    }
    Value::String(rendered.to_string())
}

fn targets_stream(path: &str) -> bool {
    path.eq_ignore_ascii_case("stream")
}

/// Parses the persisted override-operations blob: either the array form
/// (typed ops) or the legacy map form (lowered to `set`/`delete`).
/// Empty/`{}`/`[]` yields no operations.
pub fn parse_overrides(raw: &Value) -> Vec<OverrideOp> {
    match raw {
        Value::Array(entries) => entries.iter().filter_map(parse_op).collect(),
        Value::Object(map) => lower_legacy_map(map),
        _ => Vec::new(),
    }
}

fn parse_op(entry: &Value) -> Option<OverrideOp> {
    let op = entry.get("op")?.as_str()?;
    let condition = entry
        .get("condition")
        .and_then(|c| c.as_str())
        .map(str::to_string);
    let str_field = |key: &str| entry.get(key).and_then(|v| v.as_str()).map(str::to_string);

    match op {
        "set" => {
            let path = str_field("path")?;
            let value = match entry.get("value") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => return None,
            };
            Some(OverrideOp::Set { path, value, condition })
        }
        "delete" => Some(OverrideOp::Delete {
            path: str_field("path")?,
            condition,
        }),
        "rename" => Some(OverrideOp::Rename {
            from: str_field("from")?,
            to: str_field("to")?,
            condition,
        }),
        "copy" => Some(OverrideOp::Copy {
            from: str_field("from")?,
            to: str_field("to")?,
            condition,
        }),
        other => {
            warn!(op = other, "unknown override operation, skipping");
            None
        }
    }
}

/// Legacy map form: each entry becomes `set(path=key, value=stringify(v))`,
/// except values literally equal to the clear sentinel, which become
/// `delete(path=key)`.
fn lower_legacy_map(map: &serde_json::Map<String, Value>) -> Vec<OverrideOp> {
    map.iter()
        .map(|(key, value)| {
            let as_string = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if as_string == CLEAR_SENTINEL {
                OverrideOp::Delete {
                    path: key.clone(),
                    condition: None,
                }
            } else {
                OverrideOp::Set {
                    path: key.clone(),
                    value: as_string,
                    condition: None,
                }
            }
        })
        .collect()
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    current
        .as_object_mut()
        .unwrap()
        .insert(segments[segments.len() - 1].to_string(), value);
}

fn delete_path(root: &mut Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        current = current.as_object_mut()?.get_mut(*segment)?;
    }
    current.as_object_mut()?.remove(segments[segments.len() - 1])
}

/// Applies body override operations in order. Conditions are evaluated
/// per-op; a `stream`-targeting op is always skipped with a warning.
pub fn apply_body_overrides(body: &mut Value, ops: &[OverrideOp], ctx: &RenderContext) {
    for op in ops {
        if !condition_holds(op.condition(), ctx) {
            continue;
        }
        if targets_stream(op.write_path()) {
            warn!(path = op.write_path(), "override targets stream, skipping");
            continue;
        }

        match op {
            OverrideOp::Set { path, value, .. } => {
                let rendered = render_template(value, ctx);
                if rendered.trim() == CLEAR_SENTINEL {
                    delete_path(body, path);
                } else {
                    set_path(body, path, decode_or_literal(&rendered));
                }
            }
            OverrideOp::Delete { path, .. } => {
                delete_path(body, path);
            }
            OverrideOp::Rename { from, to, .. } => {
                if let Some(value) = delete_path(body, from) {
                    set_path(body, to, value);
                }
            }
            OverrideOp::Copy { from, to, .. } => {
                if let Some(value) = get_path(body, from).cloned() {
                    set_path(body, to, value);
                }
            }
        }
    }
}

/// Applies header override operations in order. `set` always stringifies
/// the rendered value; no header name is intrinsically blocked.
pub fn apply_header_overrides(headers: &mut HeaderMap, ops: &[OverrideOp], ctx: &RenderContext) {
    for op in ops {
        if !condition_holds(op.condition(), ctx) {
            continue;
        }
        if op.write_path().is_empty() {
            continue;
        }

        match op {
            OverrideOp::Set { path, value, .. } => {
                let rendered = render_template(value, ctx);
                let Some(name) = parse_header_name(path) else { continue };
                if rendered.trim() == CLEAR_SENTINEL {
                    headers.remove(&name);
                } else if let Ok(hv) = HeaderValue::from_str(&rendered) {
                    headers.insert(name, hv);
                } else {
                    warn!(header = path, "invalid header value after render, skipping");
                }
            }
            OverrideOp::Delete { path, .. } => {
                if let Some(name) = parse_header_name(path) {
                    headers.remove(&name);
                }
            }
            OverrideOp::Rename { from, to, .. } => {
                let (Some(from_name), Some(to_name)) = (parse_header_name(from), parse_header_name(to)) else {
                    continue;
                };
                if let Some(value) = headers.remove(&from_name) {
                    headers.insert(to_name, value);
                }
            }
            OverrideOp::Copy { from, to, .. } => {
                let (Some(from_name), Some(to_name)) = (parse_header_name(from), parse_header_name(to)) else {
                    continue;
                };
                if let Some(value) = headers.get(&from_name).cloned() {
                    headers.insert(to_name, value);
                }
            }
        }
    }
}

fn parse_header_name(raw: &str) -> Option<HeaderName> {
    match HeaderName::try_from(raw) {
        Ok(name) => Some(name),
        Err(err) => {
            warn!(header = raw, error = %err, "invalid header name, skipping");
            None
        }
    }
}
