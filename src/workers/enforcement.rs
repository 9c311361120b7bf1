//! Witness registry & automatic enforcement (§4.J). Witnesses are named
//! asynchronous predicates run by the *platform*, not the worker
//! implementer, on every `void(action)` call, before the worker's own
//! prediction runs (`WITNESS_AUTOMATION`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

use super::protocol::{Constraint, FeedbackChannel};

#[derive(Debug, Error, Diagnostic)]
pub enum WitnessError {
    #[error("witness {witness_id} raised while evaluating an action: {message}")]
    #[diagnostic(
        code(stepgraph::workers::witness_execution_error),
        help("Per §4.J the platform records this and continues with the remaining witnesses.")
    )]
    Execution { witness_id: String, message: String },
}

/// A named asynchronous predicate that observes a proposed action and
/// produces zero or more warnings.
#[async_trait]
pub trait Witness: Send + Sync {
    async fn check(&self, constraint: &Constraint, action: &Value) -> Result<Vec<String>, WitnessError>;
}

/// Maps `witness_id -> Witness`. Process-local, explicit lifecycle, never an
/// ambient global (§9 design note).
#[derive(Clone, Default)]
pub struct WitnessRegistry {
    witnesses: Arc<RwLock<FxHashMap<String, Arc<dyn Witness>>>>,
}

impl WitnessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, witness_id: impl Into<String>, witness: Arc<dyn Witness>) {
        self.witnesses.write().insert(witness_id.into(), witness);
    }

    #[must_use]
    pub fn contains(&self, witness_id: &str) -> bool {
        self.witnesses.read().contains_key(witness_id)
    }

    pub fn get(&self, witness_id: &str) -> Option<Arc<dyn Witness>> {
        self.witnesses.read().get(witness_id).cloned()
    }

    /// Run every witness named by `constraints` against `action`, merging
    /// their warnings. A witness that raises is recorded via `tracing::error`
    /// and skipped — the remaining witnesses still run (§4.J: "If any
    /// witness raises, the platform records a witness-execution error but
    /// continues with remaining witnesses").
    pub async fn enforce(&self, constraints: &[Constraint], action: &Value) -> Vec<String> {
        let mut warnings = Vec::new();
        for constraint in constraints {
            let Some(witness) = self.get(&constraint.witness_id) else {
                warn!(witness_id = %constraint.witness_id, "constraint references an unregistered witness; skipping");
                continue;
            };
            match witness.check(constraint, action).await {
                Ok(mut found) => warnings.append(&mut found),
                Err(err) => error!(witness_id = %constraint.witness_id, error = %err, "witness execution failed"),
            }
        }
        warnings
    }
}

/// `{worker_id, constraint_id, action_type, warnings, ts}` routed through a
/// constraint's `feedback_channel`.
#[derive(Debug, Clone)]
pub struct Violation {
    pub worker_id: String,
    pub constraint_id: String,
    pub feedback_channel: FeedbackChannel,
    pub action_type: String,
    pub warnings: Vec<String>,
    pub ts: chrono::DateTime<Utc>,
}

/// Pluggable sink for constraint violations, keyed by `feedback_channel`.
pub trait ViolationLogger: Send + Sync {
    fn log(&self, violation: &Violation);
}

/// Default logger: `alert_dashboard` -> an alert sink (logged at `error`
/// level as a stand-in for a real dashboard push), `log` -> structured
/// `tracing::warn!`, `email` -> an email sink (logged at `warn` level; no
/// concrete transport is in scope here, matching §1's "concrete ... back-ends"
/// exclusion).
#[derive(Default)]
pub struct DefaultViolationLogger;

impl ViolationLogger for DefaultViolationLogger {
    fn log(&self, violation: &Violation) {
        match violation.feedback_channel {
            FeedbackChannel::AlertDashboard => tracing::error!(
                worker_id = %violation.worker_id,
                constraint_id = %violation.constraint_id,
                action_type = %violation.action_type,
                warnings = ?violation.warnings,
                "constraint violation routed to alert_dashboard"
            ),
            FeedbackChannel::Log => tracing::warn!(
                worker_id = %violation.worker_id,
                constraint_id = %violation.constraint_id,
                action_type = %violation.action_type,
                warnings = ?violation.warnings,
                "constraint violation"
            ),
            FeedbackChannel::Email => tracing::warn!(
                worker_id = %violation.worker_id,
                constraint_id = %violation.constraint_id,
                action_type = %violation.action_type,
                warnings = ?violation.warnings,
                "constraint violation routed to email sink"
            ),
        }
    }
}

/// File-size witness: warns when an action's `content` (or `size_bytes`)
/// exceeds the constraint's `value` (parsed as a byte count).
pub struct FileSizeWitness;

#[async_trait]
impl Witness for FileSizeWitness {
    async fn check(&self, constraint: &Constraint, action: &Value) -> Result<Vec<String>, WitnessError> {
        let limit: u64 = constraint.value.parse().map_err(|err| WitnessError::Execution {
            witness_id: "file_size".to_string(),
            message: format!("constraint value {:?} is not a byte count: {err}", constraint.value),
        })?;
        let size = action
            .get("size_bytes")
            .and_then(Value::as_u64)
            .or_else(|| action.get("content").and_then(Value::as_str).map(|s| s.len() as u64))
            .unwrap_or(0);
        if size > limit {
            Ok(vec![format!("action size {size} exceeds file_size limit {limit}")])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Search-rate-limit witness: warns when `action.searches_this_window`
/// exceeds the constraint's `value`.
pub struct SearchRateLimitWitness;

#[async_trait]
impl Witness for SearchRateLimitWitness {
    async fn check(&self, constraint: &Constraint, action: &Value) -> Result<Vec<String>, WitnessError> {
        let limit: u64 = constraint.value.parse().map_err(|err| WitnessError::Execution {
            witness_id: "search_rate_limit".to_string(),
            message: format!("constraint value {:?} is not a rate: {err}", constraint.value),
        })?;
        let count = action.get("searches_this_window").and_then(Value::as_u64).unwrap_or(0);
        if count > limit {
            Ok(vec![format!("search rate {count} exceeds limit {limit} per window")])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Workspace path-traversal witness: warns when an action's `path` escapes
/// its workspace root (`..` components or an absolute path outside it).
pub struct PathTraversalWitness;

#[async_trait]
impl Witness for PathTraversalWitness {
    async fn check(&self, constraint: &Constraint, action: &Value) -> Result<Vec<String>, WitnessError> {
        let workspace_root = &constraint.value;
        let Some(path) = action.get("path").and_then(Value::as_str) else {
            return Ok(Vec::new());
        };
        let escapes = path.contains("..") || (path.starts_with('/') && !path.starts_with(workspace_root.as_str()));
        if escapes {
            Ok(vec![format!("path {path:?} escapes workspace root {workspace_root:?}")])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Network-denial witness for sandboxed workers: warns on any action naming
/// a network destination (`host`/`url`).
pub struct NetworkDenialWitness;

#[async_trait]
impl Witness for NetworkDenialWitness {
    async fn check(&self, _constraint: &Constraint, action: &Value) -> Result<Vec<String>, WitnessError> {
        if action.get("host").is_some() || action.get("url").is_some() {
            Ok(vec!["network access is denied for sandboxed workers".to_string()])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Registry pre-populated with the four built-in witnesses (§4.J).
#[must_use]
pub fn builtin_witness_registry() -> WitnessRegistry {
    let registry = WitnessRegistry::new();
    registry.register("file_size", Arc::new(FileSizeWitness));
    registry.register("search_rate_limit", Arc::new(SearchRateLimitWitness));
    registry.register("workspace_path_traversal", Arc::new(PathTraversalWitness));
    registry.register("network_denial", Arc::new(NetworkDenialWitness));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint(id: &str, witness_id: &str, value: &str) -> Constraint {
        Constraint {
            constraint_id: id.to_string(),
            witness_id: witness_id.to_string(),
            value: value.to_string(),
            feedback_channel: FeedbackChannel::Log,
        }
    }

    #[tokio::test]
    async fn file_size_witness_warns_over_limit() {
        let registry = builtin_witness_registry();
        let constraints = vec![constraint("c1", "file_size", "1000000")];
        let action = serde_json::json!({ "type": "write", "content": "x".repeat(2_000_000) });
        let warnings = registry.enforce(&constraints, &action).await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("2000000"));
        assert!(warnings[0].contains("1000000"));
    }

    #[tokio::test]
    async fn file_size_witness_silent_under_limit() {
        let registry = builtin_witness_registry();
        let constraints = vec![constraint("c1", "file_size", "1000000")];
        let action = serde_json::json!({ "type": "write", "content": "small" });
        let warnings = registry.enforce(&constraints, &action).await;
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn unregistered_witness_is_skipped_not_fatal() {
        let registry = WitnessRegistry::new();
        let constraints = vec![constraint("c1", "does_not_exist", "1")];
        let warnings = registry.enforce(&constraints, &serde_json::json!({})).await;
        assert!(warnings.is_empty());
    }
}
