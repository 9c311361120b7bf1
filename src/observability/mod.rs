//! Output sanitisation and span metadata for the observation pipeline (§4.E).
//!
//! The executor opens a root span per execution and flushes it on both the
//! success and failure paths; before a result is attached to that span, it
//! passes through [`sanitize_value`] so that oversized strings never reach a
//! downstream dashboard unbounded.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Metadata attached to an execution's root span (§4.E).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpanMetadata {
    pub workflow_name: String,
    pub environment: String,
    pub workflow_path: String,
    pub runtime_version: &'static str,
}

impl SpanMetadata {
    #[must_use]
    pub fn new(workflow_path: impl Into<String>, environment: impl Into<String>) -> Self {
        let workflow_path = workflow_path.into();
        let workflow_name = std::path::Path::new(&workflow_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| workflow_path.clone());
        Self {
            workflow_name,
            environment: environment.into(),
            workflow_path,
            runtime_version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Tags propagated alongside the metadata: `{platform, workflow:X,
    /// env:Y}`, plus `agent-present` when `has_agents` is set.
    #[must_use]
    pub fn tags(&self, has_agents: bool) -> Vec<String> {
        let mut tags = vec![
            "platform:stepgraph".to_string(),
            format!("workflow:{}", self.workflow_name),
            format!("env:{}", self.environment),
        ];
        if has_agents {
            tags.push("agent-present".to_string());
        }
        tags
    }
}

const DEFAULT_MAX_LENGTH: usize = 2000;
const TRUNCATION_SUFFIX: &str = "... [truncated]";

/// Metadata recorded alongside a sanitised value: `{field}_truncated` and
/// `{field}_full_length` for every string that was cut down.
pub type SanitizeMetadata = FxHashMap<String, Value>;

/// Truncate every string in `data` longer than `max_length`, recursing
/// through objects and arrays, and record pre-truncation lengths in the
/// returned metadata map (§4.E sanitiser).
pub fn sanitize_value(data: &Value, max_length: usize) -> (Value, SanitizeMetadata) {
    let mut metadata = SanitizeMetadata::default();
    let sanitized = sanitize_inner(data, max_length, "", &mut metadata);
    (sanitized, metadata)
}

/// Convenience wrapper using the default 2000-character limit.
pub fn sanitize_for_dashboard(data: &Value) -> (Value, SanitizeMetadata) {
    sanitize_value(data, DEFAULT_MAX_LENGTH)
}

fn sanitize_inner(data: &Value, max_length: usize, path: &str, metadata: &mut SanitizeMetadata) -> Value {
    match data {
        Value::String(s) if s.len() > max_length => {
            let truncated: String = s.chars().take(max_length).collect();
            let sanitized = format!("{truncated}{TRUNCATION_SUFFIX}");
            let key = if path.is_empty() { "output".to_string() } else { path.to_string() };
            metadata.insert(format!("{key}_truncated"), Value::Bool(true));
            metadata.insert(format!("{key}_full_length"), Value::from(s.chars().count()));
            metadata.insert(format!("{key}_displayed_length"), Value::from(sanitized.chars().count()));
            Value::String(sanitized)
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                out.insert(key.clone(), sanitize_inner(value, max_length, &child_path, metadata));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let child_path = if path.is_empty() { format!("item_{i}") } else { format!("{path}[{i}]") };
                    sanitize_inner(item, max_length, &child_path, metadata)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Sanitise a full execution result map (one entry per top-level state
/// field), merging each field's metadata under `{field}_{key}` as the
/// original did per-field rather than recursively for the top level.
pub fn sanitize_workflow_result(result: &FxHashMap<String, Value>) -> (FxHashMap<String, Value>, SanitizeMetadata) {
    let mut sanitized = FxHashMap::default();
    let mut all_metadata = SanitizeMetadata::default();

    for (key, value) in result {
        let (sanitized_value, value_metadata) = sanitize_for_dashboard(value);
        sanitized.insert(key.clone(), sanitized_value);
        for (sub_key, sub_value) in value_metadata {
            all_metadata.insert(format!("{key}_{sub_key}"), sub_value);
        }
    }

    (sanitized, all_metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_pass_through_unchanged() {
        let (sanitized, metadata) = sanitize_for_dashboard(&Value::String("short".into()));
        assert_eq!(sanitized, Value::String("short".into()));
        assert!(metadata.is_empty());
    }

    #[test]
    fn long_strings_are_truncated_with_metadata() {
        let long = "x".repeat(3000);
        let (sanitized, metadata) = sanitize_value(&Value::String(long.clone()), 2000);
        let Value::String(s) = sanitized else { panic!("expected string") };
        assert!(s.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(metadata.get("output_full_length"), Some(&Value::from(3000)));
    }

    #[test]
    fn recurses_through_nested_objects_and_arrays() {
        let long = "y".repeat(2500);
        let data = serde_json::json!({ "nested": { "items": [long] } });
        let (sanitized, metadata) = sanitize_for_dashboard(&data);
        let truncated = &sanitized["nested"]["items"][0];
        assert!(truncated.as_str().unwrap().ends_with(TRUNCATION_SUFFIX));
        assert!(metadata.contains_key("nested.items[0]_full_length"));
    }

    #[test]
    fn span_metadata_derives_workflow_name_from_path_stem() {
        let meta = SpanMetadata::new("/workflows/optimize_evaluate.yaml", "dev");
        assert_eq!(meta.workflow_name, "optimize_evaluate");
        assert_eq!(meta.tags(true), vec!["platform:stepgraph", "workflow:optimize_evaluate", "env:dev", "agent-present"]);
    }
}
