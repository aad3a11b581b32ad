//! Step input templating.
//!
//! Inputs may reference earlier outputs as `{{<step_id>.outputs.<path>}}`,
//! where `<path>` is a dot-separated walk through objects (numeric segments
//! index arrays).

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::core::node::Payload;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)\.outputs\.([A-Za-z0-9_\-.]+)\s*\}\}").unwrap()
});

fn lookup<'a>(
    outputs: &'a HashMap<String, Payload>,
    step_id: &str,
    path: &str,
) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = outputs.get(step_id)?.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_string(text: &str, outputs: &HashMap<String, Payload>) -> Value {
    // A lone placeholder keeps the referenced value's JSON type.
    if let Some(caps) = PLACEHOLDER_RE.captures(text) {
        if caps.get(0).map(|m| m.as_str()) == Some(text.trim()) {
            if let Some(value) = lookup(outputs, &caps[1], &caps[2]) {
                return value.clone();
            }
            return Value::String(text.to_string());
        }
    }

    let replaced = PLACEHOLDER_RE.replace_all(text, |caps: &Captures| {
        lookup(outputs, &caps[1], &caps[2])
            .map(value_to_text)
            .unwrap_or_else(|| caps[0].to_string())
    });
    Value::String(replaced.into_owned())
}

fn resolve_value(value: &Value, outputs: &HashMap<String, Payload>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, outputs),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, outputs)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replace output placeholders in `inputs` with values from `outputs`.
///
/// Unresolvable placeholders are left untouched.
pub fn resolve_inputs(inputs: &Payload, outputs: &HashMap<String, Payload>) -> Payload {
    inputs
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, outputs)))
        .collect()
}

/// True if any string in `inputs` still contains a placeholder.
pub(crate) fn has_placeholders(inputs: &Payload) -> bool {
    fn visit(value: &Value) -> bool {
        match value {
            Value::String(s) => PLACEHOLDER_RE.is_match(s),
            Value::Array(items) => items.iter().any(visit),
            Value::Object(map) => map.values().any(visit),
            _ => false,
        }
    }
    inputs.values().any(visit)
}
