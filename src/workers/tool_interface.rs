//! Worker tool interface (§6): the four operations exposed to outside
//! callers — `spawn_worker`, `execute_in_worker`, `get_worker_state`,
//! `kill_worker`. `execute_in_worker` automatically calls `void` first and
//! refuses on non-empty warnings, returning a `constraint_violation`
//! response instead of delegating to `execute`.

use std::sync::Arc;

use serde_json::Value;

use super::factory::{WorkerFactory, WorkerFactoryError, WorkerSource};
use super::isolation::IsolationBackend;
use super::protocol::{ExecutionResult, WorkerState};

/// Result of [`execute_in_worker`]: either the side-effecting result went
/// through, or `void` surfaced warnings and the call was refused.
#[derive(Debug, Clone)]
pub enum ToolExecuteOutcome {
    Executed(ExecutionResult),
    ConstraintViolation { warnings: Vec<String> },
}

pub async fn spawn_worker(
    factory: &WorkerFactory,
    source: WorkerSource,
    journey_id: impl Into<String>,
    isolation: Arc<dyn IsolationBackend>,
) -> Result<(), WorkerFactoryError> {
    factory.spawn(source, journey_id, isolation).await?;
    Ok(())
}

/// Automatically calls `void(action)` first (§4.J/§6) and refuses to
/// delegate to `execute` if it returns any warnings.
pub async fn execute_in_worker(factory: &WorkerFactory, journey_id: &str, action: &Value) -> Result<ToolExecuteOutcome, WorkerFactoryError> {
    let worker = factory.resume(journey_id)?;

    let void_result = worker.void(action).await?;

    if !void_result.warnings.is_empty() {
        return Ok(ToolExecuteOutcome::ConstraintViolation { warnings: void_result.warnings });
    }

    let execution = worker.execute(action).await?;
    Ok(ToolExecuteOutcome::Executed(execution))
}

pub async fn get_worker_state(factory: &WorkerFactory, journey_id: &str) -> Result<WorkerState, WorkerFactoryError> {
    let worker = factory.resume(journey_id)?;
    Ok(worker.state().await?)
}

pub async fn kill_worker(factory: &WorkerFactory, journey_id: &str) -> Result<(), WorkerFactoryError> {
    factory.kill(journey_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::definitions::{Audit, ConstraintSpec, Identity, RuntimeSpec, TrustLevel, WorkerDefinition};
    use crate::workers::enforcement::builtin_witness_registry;
    use crate::workers::isolation::ProcessBackend;
    use crate::workers::protocol::FeedbackChannel;

    fn def(template: &str) -> WorkerDefinition {
        WorkerDefinition {
            worker_id: "w".to_string(),
            identity: Identity { name: "W".to_string(), system_prompt: "help".to_string(), onboarding_steps: Vec::new() },
            constraints: vec![ConstraintSpec {
                constraint_id: "max_size".to_string(),
                witness: "file_size".to_string(),
                value: "1000000".to_string(),
                feedback: FeedbackChannel::Log,
            }],
            runtime: RuntimeSpec { container: None, workspace_template: template.to_string(), tools: vec![], session_persistence: false },
            trust_level: TrustLevel::Sandboxed,
            audit: Audit::default(),
        }
    }

    #[tokio::test]
    async fn execute_in_worker_refuses_on_constraint_violation() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("{journey_id}");
        let factory = WorkerFactory::new(builtin_witness_registry());
        let isolation: Arc<dyn IsolationBackend> = Arc::new(ProcessBackend::new());
        spawn_worker(&factory, def(&template.display().to_string()).into(), "journey-x", isolation).await.unwrap();

        let action = serde_json::json!({ "type": "write", "content": "x".repeat(2_000_000) });
        let outcome = execute_in_worker(&factory, "journey-x", &action).await.unwrap();
        assert!(matches!(outcome, ToolExecuteOutcome::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn execute_in_worker_executes_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("{journey_id}");
        let factory = WorkerFactory::new(builtin_witness_registry());
        let isolation: Arc<dyn IsolationBackend> = Arc::new(ProcessBackend::new());
        spawn_worker(&factory, def(&template.display().to_string()).into(), "journey-y", isolation).await.unwrap();

        let action = serde_json::json!({ "type": "write", "path": "a.txt", "content": "ok" });
        let outcome = execute_in_worker(&factory, "journey-y", &action).await.unwrap();
        assert!(matches!(outcome, ToolExecuteOutcome::Executed(_)));
    }
}
