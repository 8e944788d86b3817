//! `$NAME` / `${NAME}` expansion.
//!
//! Expansion is a single left-to-right pass: substituted text is never
//! re-scanned, and a reference with no value is kept verbatim.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("variable pattern is a valid regex")
});

/// Expand variable references in `input`, resolving names through `lookup`.
pub fn expand<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains('$') {
        return input.to_string();
    }
    VAR_PATTERN
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Expand every string leaf of a JSON tree. Object keys are left alone.
pub fn expand_json<F>(value: &serde_json::Value, lookup: &F) -> serde_json::Value
where
    F: Fn(&str) -> Option<String>,
{
    use serde_json::Value;

    match value {
        Value::String(s) => Value::String(expand(s, lookup)),
        Value::Array(items) => Value::Array(items.iter().map(|v| expand_json(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_json(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}
