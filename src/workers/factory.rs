//! Worker factory & journey registry (§4.H): keeps a process-local
//! `journey_id -> worker` registry guarded by a lightweight lock;
//! `spawn`/`resume`/`kill` are mutually exclusive per `journey_id`
//! (§5 shared-resources note).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;

use super::definitions::{load_and_validate, DefinitionError, WorkerDefinition};
use super::enforcement::{DefaultViolationLogger, ViolationLogger, Violation, WitnessRegistry};
use super::isolation::{IsolationBackend, IsolationHandle};
use super::protocol::{
    assert_execute_honesty, assert_void_purity, Constraint, ExecutionResult, FlowAction, Pressure, VoidResult, Worker,
    WorkerError, WorkerState,
};

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerFactoryError {
    #[error("journey {journey_id} already has a live worker")]
    #[diagnostic(
        code(stepgraph::workers::journey_collision),
        help("Call kill(journey_id) first, or resume the existing worker instead of spawning a new one.")
    )]
    JourneyCollision { journey_id: String },

    #[error("no live worker for journey {journey_id}")]
    #[diagnostic(code(stepgraph::workers::unknown_journey))]
    UnknownJourney { journey_id: String },

    #[error("failed to materialise isolation boundary for journey {journey_id}: {message}")]
    #[diagnostic(code(stepgraph::workers::isolation_failure))]
    IsolationFailure { journey_id: String, message: String },

    #[error(transparent)]
    #[diagnostic(code(stepgraph::workers::definition))]
    Definition(#[from] DefinitionError),

    #[error("failed to read worker definition at {path}: {message}")]
    #[diagnostic(code(stepgraph::workers::definition_io))]
    DefinitionIo { path: String, message: String },

    #[error(transparent)]
    #[diagnostic(code(stepgraph::workers::worker))]
    Worker(#[from] WorkerError),
}

/// Either an already-parsed definition or a path the factory should load and
/// validate before spawning (§4.H factory step 2).
pub enum WorkerSource {
    Definition(WorkerDefinition),
    Path(String),
}

impl From<WorkerDefinition> for WorkerSource {
    fn from(def: WorkerDefinition) -> Self {
        WorkerSource::Definition(def)
    }
}

/// `workspace_path = substitute(definition.runtime.workspace_template,
/// journey_id)`, falling back to `template + "/" + journey_id` when the
/// template carries no `{journey_id}` placeholder (§4.H factory step 3).
#[must_use]
pub fn substitute_workspace(template: &str, journey_id: &str) -> PathBuf {
    if template.contains("{journey_id}") {
        PathBuf::from(template.replace("{journey_id}", journey_id))
    } else {
        PathBuf::from(format!("{template}/{journey_id}"))
    }
}

/// Keeps a registry `journey_id -> worker` (§4.H). At most one live worker
/// per `journey_id` per definition (invariant `JOURNEY_ISOLATION`, §3).
#[derive(Clone)]
pub struct WorkerFactory {
    registry: Arc<RwLock<FxHashMap<String, Arc<dyn Worker>>>>,
    witnesses: WitnessRegistry,
    violation_logger: Arc<dyn ViolationLogger>,
}

impl WorkerFactory {
    #[must_use]
    pub fn new(witnesses: WitnessRegistry) -> Self {
        Self {
            registry: Arc::new(RwLock::new(FxHashMap::default())),
            witnesses,
            violation_logger: Arc::new(DefaultViolationLogger),
        }
    }

    #[must_use]
    pub fn with_violation_logger(mut self, logger: Arc<dyn ViolationLogger>) -> Self {
        self.violation_logger = logger;
        self
    }

    /// Resolve `source` into a validated [`WorkerDefinition`], compute its
    /// workspace path, wrap a [`DeclarativeWorker`] in the automatic
    /// witness-enforcement decorator, register it, and return it.
    pub async fn spawn(
        &self,
        source: WorkerSource,
        journey_id: impl Into<String>,
        isolation: Arc<dyn IsolationBackend>,
    ) -> Result<Arc<dyn Worker>, WorkerFactoryError> {
        let journey_id = journey_id.into();
        if self.registry.read().contains_key(&journey_id) {
            return Err(WorkerFactoryError::JourneyCollision { journey_id });
        }

        let definition = match source {
            WorkerSource::Definition(def) => def,
            WorkerSource::Path(path) => {
                let yaml = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|err| WorkerFactoryError::DefinitionIo { path: path.clone(), message: err.to_string() })?;
                load_and_validate(&yaml, &self.witnesses)?
            }
        };

        let workspace_path = substitute_workspace(&definition.runtime.workspace_template, &journey_id);
        let inner: Arc<dyn Worker> = Arc::new(DeclarativeWorker::new(definition, journey_id.clone(), workspace_path, isolation));
        let worker: Arc<dyn Worker> = Arc::new(WitnessEnforcingWorker::new(inner, self.witnesses.clone(), self.violation_logger.clone()));

        // Re-check under the write lock to keep spawn/kill mutually exclusive
        // per journey_id even under concurrent callers.
        let mut registry = self.registry.write();
        if registry.contains_key(&journey_id) {
            return Err(WorkerFactoryError::JourneyCollision { journey_id });
        }
        registry.insert(journey_id, worker.clone());
        Ok(worker)
    }

    pub fn resume(&self, journey_id: &str) -> Result<Arc<dyn Worker>, WorkerFactoryError> {
        self.registry
            .read()
            .get(journey_id)
            .cloned()
            .ok_or_else(|| WorkerFactoryError::UnknownJourney { journey_id: journey_id.to_string() })
    }

    /// Remove `journey_id` from the registry and release its resources.
    /// `cleanup()` must be idempotent; so is `kill` itself (§4.H).
    pub async fn kill(&self, journey_id: &str) -> Result<(), WorkerFactoryError> {
        let worker = self.registry.write().remove(journey_id);
        if let Some(worker) = worker {
            worker.cleanup().await.map_err(|err| WorkerFactoryError::IsolationFailure {
                journey_id: journey_id.to_string(),
                message: err.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn live_journeys(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }
}

/// Wraps an inner [`Worker`] with the automatic witness-enforcement contract
/// (`WITNESS_AUTOMATION`, §4.J): every `void(action)` call runs all of the
/// worker's witnesses first, merges their warnings into the `VoidResult`,
/// and routes any violation through the owning constraint's
/// `feedback_channel`. `execute` is not required to re-run witnesses and is
/// delegated unchanged.
struct WitnessEnforcingWorker {
    inner: Arc<dyn Worker>,
    witnesses: WitnessRegistry,
    violation_logger: Arc<dyn ViolationLogger>,
}

impl WitnessEnforcingWorker {
    fn new(inner: Arc<dyn Worker>, witnesses: WitnessRegistry, violation_logger: Arc<dyn ViolationLogger>) -> Self {
        Self { inner, witnesses, violation_logger }
    }
}

#[async_trait]
impl Worker for WitnessEnforcingWorker {
    fn worker_id(&self) -> &str {
        self.inner.worker_id()
    }

    async fn state(&self) -> Result<WorkerState, WorkerError> {
        self.inner.state().await
    }

    async fn pressure(&self) -> Result<Vec<Pressure>, WorkerError> {
        self.inner.pressure().await
    }

    async fn constraints(&self) -> Vec<Constraint> {
        self.inner.constraints().await
    }

    async fn flow(&self, context: &serde_json::Map<String, Value>) -> Result<Vec<FlowAction>, WorkerError> {
        self.inner.flow(context).await
    }

    async fn void(&self, action: &Value) -> Result<VoidResult, WorkerError> {
        let constraints = self.inner.constraints().await;
        let action_type = action.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string();

        let mut all_warnings = Vec::new();
        for constraint in &constraints {
            let Some(witness) = self.witnesses.get(&constraint.witness_id) else {
                tracing::warn!(witness_id = %constraint.witness_id, "constraint references an unregistered witness; skipping");
                continue;
            };
            match witness.check(constraint, action).await {
                Ok(warnings) if warnings.is_empty() => {}
                Ok(warnings) => {
                    self.violation_logger.log(&Violation {
                        worker_id: self.inner.worker_id().to_string(),
                        constraint_id: constraint.constraint_id.clone(),
                        feedback_channel: constraint.feedback_channel,
                        action_type: action_type.clone(),
                        warnings: warnings.clone(),
                        ts: Utc::now(),
                    });
                    all_warnings.extend(warnings);
                }
                Err(err) => {
                    tracing::error!(witness_id = %constraint.witness_id, error = %err, "witness execution failed");
                }
            }
        }

        let mut result = self.inner.void(action).await?;
        assert_void_purity(self.inner.worker_id(), &result)?;
        result.warnings.extend(all_warnings);
        Ok(result)
    }

    async fn execute(&self, action: &Value) -> Result<ExecutionResult, WorkerError> {
        let result = self.inner.execute(action).await?;
        assert_execute_honesty(self.inner.worker_id(), &result)?;
        Ok(result)
    }

    async fn evolve(&self, feedback: &Value) -> Result<(), WorkerError> {
        self.inner.evolve(feedback).await
    }

    async fn cleanup(&self) -> Result<(), WorkerError> {
        self.inner.cleanup().await
    }
}

/// The worker instance a [`WorkerDefinition`] describes: purely declarative
/// identity/constraints/runtime plus an [`IsolationBackend`] it lazily
/// materialises on first `execute` (§4.H). Supports a small fixed action
/// vocabulary — `{"type": "write"|"read"|"command", ...}` — since the
/// definition itself carries no executable code (§4.I).
pub struct DeclarativeWorker {
    definition: WorkerDefinition,
    journey_id: String,
    workspace_path: PathBuf,
    isolation: Arc<dyn IsolationBackend>,
    handle: OnceCell<IsolationHandle>,
}

impl DeclarativeWorker {
    #[must_use]
    pub fn new(definition: WorkerDefinition, journey_id: String, workspace_path: PathBuf, isolation: Arc<dyn IsolationBackend>) -> Self {
        Self { definition, journey_id, workspace_path, isolation, handle: OnceCell::new() }
    }

    async fn materialized_handle(&self) -> Result<&IsolationHandle, WorkerError> {
        self.handle
            .get_or_try_init(|| async {
                let image = self.definition.runtime.container.as_deref();
                self.isolation
                    .spawn(&self.journey_id, &self.workspace_path, image, false)
                    .await
                    .map_err(|err| WorkerError::IsolationFailure { worker_id: self.definition.worker_id.clone(), message: err.to_string() })
            })
            .await
    }
}

#[async_trait]
impl Worker for DeclarativeWorker {
    fn worker_id(&self) -> &str {
        &self.definition.worker_id
    }

    async fn state(&self) -> Result<WorkerState, WorkerError> {
        let mut data = serde_json::Map::new();
        data.insert("journey_id".into(), Value::String(self.journey_id.clone()));
        data.insert("trust_level".into(), serde_json::to_value(self.definition.trust_level).unwrap_or(Value::Null));
        data.insert("workspace_path".into(), Value::String(self.workspace_path.display().to_string()));
        data.insert("isolation_live".into(), Value::Bool(self.handle.get().is_some()));
        Ok(WorkerState {
            worker_id: self.definition.worker_id.clone(),
            worker_type: "declarative".to_string(),
            timestamp: Utc::now(),
            data,
        })
    }

    async fn pressure(&self) -> Result<Vec<Pressure>, WorkerError> {
        // Advisory hook with no mandated semantics (§9); this worker reports none.
        Ok(Vec::new())
    }

    async fn constraints(&self) -> Vec<Constraint> {
        self.definition.constraints.iter().cloned().map(super::definitions::ConstraintSpec::into_constraint).collect()
    }

    async fn flow(&self, _context: &serde_json::Map<String, Value>) -> Result<Vec<FlowAction>, WorkerError> {
        Ok(self
            .definition
            .runtime
            .tools
            .iter()
            .map(|tool| FlowAction {
                action_id: format!("{tool}-{}", self.journey_id),
                action_type: tool.clone(),
                description: format!("invoke tool {tool}"),
                estimated_cost: None,
                prerequisites: Vec::new(),
            })
            .collect())
    }

    async fn void(&self, action: &Value) -> Result<VoidResult, WorkerError> {
        let action_id = action.get("action_id").and_then(Value::as_str).unwrap_or("unnamed").to_string();
        let action_type = action.get("type").and_then(Value::as_str).unwrap_or("unknown");

        let mut predicted_outcome = serde_json::Map::new();
        match action_type {
            "write" => {
                let size = action
                    .get("size_bytes")
                    .and_then(Value::as_u64)
                    .or_else(|| action.get("content").and_then(Value::as_str).map(|s| s.len() as u64))
                    .unwrap_or(0);
                predicted_outcome.insert("bytes_to_write".into(), Value::from(size));
                if let Some(path) = action.get("path") {
                    predicted_outcome.insert("path".into(), path.clone());
                }
            }
            "read" => {
                if let Some(path) = action.get("path") {
                    predicted_outcome.insert("would_read".into(), path.clone());
                }
            }
            "command" => {
                if let Some(command) = action.get("command") {
                    predicted_outcome.insert("would_run".into(), command.clone());
                }
            }
            other => {
                predicted_outcome.insert("unrecognized_action_type".into(), Value::String(other.to_string()));
            }
        }

        Ok(VoidResult {
            action_id,
            success: true,
            predicted_outcome,
            side_effect_occurred: false,
            simulation_timestamp: Utc::now(),
            warnings: Vec::new(),
        })
    }

    async fn execute(&self, action: &Value) -> Result<ExecutionResult, WorkerError> {
        let started = std::time::Instant::now();
        let action_id = action.get("action_id").and_then(Value::as_str).unwrap_or("unnamed").to_string();
        let action_type = action.get("type").and_then(Value::as_str).unwrap_or("unknown");
        let handle = self.materialized_handle().await?;

        let mut actual_outcome = serde_json::Map::new();
        let mut side_effect_occurred = false;

        match action_type {
            "write" => {
                let path = action.get("path").and_then(Value::as_str).unwrap_or("output.txt");
                let content = action.get("content").and_then(Value::as_str).unwrap_or("");
                let escaped = content.replace('\'', "'\\''");
                let command = format!("printf '%s' '{escaped}' > {path}");
                let result = self
                    .isolation
                    .exec(handle, &command, None, std::time::Duration::from_secs(30))
                    .await
                    .map_err(|err| WorkerError::IsolationFailure { worker_id: self.definition.worker_id.clone(), message: err.to_string() })?;
                side_effect_occurred = result.exit_code == 0;
                actual_outcome.insert("exit_code".into(), Value::from(result.exit_code));
                actual_outcome.insert("path".into(), Value::String(path.to_string()));
            }
            "read" => {
                let path = action.get("path").and_then(Value::as_str).unwrap_or("output.txt");
                let result = self
                    .isolation
                    .exec(handle, &format!("cat {path}"), None, std::time::Duration::from_secs(30))
                    .await
                    .map_err(|err| WorkerError::IsolationFailure { worker_id: self.definition.worker_id.clone(), message: err.to_string() })?;
                side_effect_occurred = true;
                actual_outcome.insert("content".into(), Value::String(result.output));
            }
            "command" => {
                let command = action.get("command").and_then(Value::as_str).unwrap_or("true");
                let result = self
                    .isolation
                    .exec(handle, command, None, std::time::Duration::from_secs(30))
                    .await
                    .map_err(|err| WorkerError::IsolationFailure { worker_id: self.definition.worker_id.clone(), message: err.to_string() })?;
                side_effect_occurred = true;
                actual_outcome.insert("exit_code".into(), Value::from(result.exit_code));
                actual_outcome.insert("output".into(), Value::String(result.output));
            }
            other => {
                actual_outcome.insert("unrecognized_action_type".into(), Value::String(other.to_string()));
            }
        }

        Ok(ExecutionResult {
            action_id,
            success: side_effect_occurred,
            actual_outcome,
            side_effect_occurred,
            execution_timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            audit_log_id: format!("audit-{}", uuid::Uuid::new_v4()),
        })
    }

    async fn evolve(&self, _feedback: &Value) -> Result<(), WorkerError> {
        // Advisory hook with no mandated semantics (§9); a no-op here.
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), WorkerError> {
        if let Some(handle) = self.handle.get() {
            self.isolation
                .kill(handle)
                .await
                .map_err(|err| WorkerError::IsolationFailure { worker_id: self.definition.worker_id.clone(), message: err.to_string() })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::enforcement::builtin_witness_registry;
    use crate::workers::isolation::ProcessBackend;

    fn sample_definition(id: &str, template: &str) -> WorkerDefinition {
        WorkerDefinition {
            worker_id: id.to_string(),
            identity: super::super::definitions::Identity {
                name: "Test Worker".to_string(),
                system_prompt: "be helpful".to_string(),
                onboarding_steps: Vec::new(),
            },
            constraints: vec![super::super::definitions::ConstraintSpec {
                constraint_id: "max_size".to_string(),
                witness: "file_size".to_string(),
                value: "1000000".to_string(),
                feedback: crate::workers::protocol::FeedbackChannel::Log,
            }],
            runtime: super::super::definitions::RuntimeSpec {
                container: None,
                workspace_template: template.to_string(),
                tools: vec!["write_file".to_string()],
                session_persistence: false,
            },
            trust_level: super::super::definitions::TrustLevel::Sandboxed,
            audit: super::super::definitions::Audit::default(),
        }
    }

    #[test]
    fn substitute_workspace_uses_placeholder() {
        let path = substitute_workspace("/workspaces/{journey_id}", "abc");
        assert_eq!(path, PathBuf::from("/workspaces/abc"));
    }

    #[test]
    fn substitute_workspace_falls_back_to_join() {
        let path = substitute_workspace("/workspaces", "abc");
        assert_eq!(path, PathBuf::from("/workspaces/abc"));
    }

    #[tokio::test]
    async fn spawn_rejects_journey_collision_then_succeeds_after_kill() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("{journey_id}");
        let factory = WorkerFactory::new(builtin_witness_registry());
        let def = sample_definition("w1", &template.display().to_string());

        let isolation: Arc<dyn IsolationBackend> = Arc::new(ProcessBackend::new());
        factory.spawn(def.clone().into(), "journey-1", isolation.clone()).await.unwrap();

        let err = factory.spawn(def.clone().into(), "journey-1", isolation.clone()).await.unwrap_err();
        assert!(matches!(err, WorkerFactoryError::JourneyCollision { .. }));

        factory.kill("journey-1").await.unwrap();
        factory.spawn(def.into(), "journey-1", isolation).await.unwrap();
    }

    #[tokio::test]
    async fn resume_unknown_journey_errors() {
        let factory = WorkerFactory::new(builtin_witness_registry());
        let err = factory.resume("ghost").unwrap_err();
        assert!(matches!(err, WorkerFactoryError::UnknownJourney { .. }));
    }

    #[tokio::test]
    async fn void_never_reports_a_side_effect_and_merges_witness_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("{journey_id}");
        let factory = WorkerFactory::new(builtin_witness_registry());
        let def = sample_definition("w2", &template.display().to_string());
        let isolation: Arc<dyn IsolationBackend> = Arc::new(ProcessBackend::new());
        let worker = factory.spawn(def.into(), "journey-2", isolation).await.unwrap();

        let action = serde_json::json!({ "type": "write", "content": "x".repeat(2_000_000) });
        let result = worker.void(&action).await.unwrap();
        assert!(!result.side_effect_occurred);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("2000000"));
    }

    #[tokio::test]
    async fn execute_honesty_holds_for_a_real_write() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("{journey_id}");
        let factory = WorkerFactory::new(builtin_witness_registry());
        let def = sample_definition("w3", &template.display().to_string());
        let isolation: Arc<dyn IsolationBackend> = Arc::new(ProcessBackend::new());
        let worker = factory.spawn(def.into(), "journey-3", isolation).await.unwrap();

        let action = serde_json::json!({ "type": "write", "path": "out.txt", "content": "hello" });
        let result = worker.execute(&action).await.unwrap();
        assert!(result.success);
        assert!(result.side_effect_occurred);
    }
}
