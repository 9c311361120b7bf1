//! The seven-operation worker protocol (§4.H): `state`, `pressure`,
//! `constraints`, `flow`, `void`, `execute`, `evolve`. This is the manager's
//! *only* interface to a worker instance — internal coordination channels
//! are never exposed across it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error("worker {worker_id} witness contract violated: void() reported a side effect")]
    #[diagnostic(
        code(stepgraph::workers::witness_contract),
        help("void() must only issue read-style or dry-run queries; this is a bug in the worker implementation.")
    )]
    WitnessContract { worker_id: String },

    #[error("worker {worker_id} execute contract violated: success without a recorded side effect")]
    #[diagnostic(code(stepgraph::workers::execute_contract))]
    ExecuteContract { worker_id: String },

    #[error("worker {worker_id} isolation failure: {message}")]
    #[diagnostic(code(stepgraph::workers::isolation_failure))]
    IsolationFailure { worker_id: String, message: String },
}

/// `(name, fn, kind)` analogue for the worker side: a point-in-time snapshot
/// of a worker's reality (connection status, resource availability, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: String,
    pub worker_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Map<String, Value>,
}

/// Unfulfilled demand or constraint violation a worker is currently
/// experiencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pressure {
    pub pressure_id: String,
    pub source: String,
    pub description: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A sacred limit a worker must not violate, resolved from its definition's
/// constraint list (§3 Constraint / §4.I).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub constraint_id: String,
    pub witness_id: String,
    pub value: String,
    pub feedback_channel: FeedbackChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackChannel {
    AlertDashboard,
    Log,
    Email,
}

/// One admissible action a worker can currently perform, with its estimated
/// cost and prerequisites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowAction {
    pub action_id: String,
    pub action_type: String,
    pub description: String,
    pub estimated_cost: Option<f64>,
    pub prerequisites: Vec<String>,
}

/// Result of `void`: a pure prediction. `side_effect_occurred` **must** be
/// `false` — the witness/execute-contract invariants (§8) treat a violation
/// as caller-fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidResult {
    pub action_id: String,
    pub success: bool,
    pub predicted_outcome: serde_json::Map<String, Value>,
    pub side_effect_occurred: bool,
    pub simulation_timestamp: DateTime<Utc>,
    pub warnings: Vec<String>,
}

/// Result of `execute`: if `success` is true, `side_effect_occurred` **must**
/// also be true (§8 Execute honesty invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action_id: String,
    pub success: bool,
    pub actual_outcome: serde_json::Map<String, Value>,
    pub side_effect_occurred: bool,
    pub execution_timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub audit_log_id: String,
}

/// The manager's only interface to a worker instance. Implementations keep
/// their internal coordination state (observation/intent/coordination/
/// execution channels, in the teacher's terms) entirely hidden behind these
/// seven operations.
#[async_trait]
pub trait Worker: Send + Sync {
    fn worker_id(&self) -> &str;

    async fn state(&self) -> Result<WorkerState, WorkerError>;
    async fn pressure(&self) -> Result<Vec<Pressure>, WorkerError>;
    async fn constraints(&self) -> Vec<Constraint>;
    async fn flow(&self, context: &serde_json::Map<String, Value>) -> Result<Vec<FlowAction>, WorkerError>;

    /// Simulate `action` without side effects. Callers enforcing witnesses
    /// (§4.J) run every registered constraint against `action` before
    /// delegating to this method.
    async fn void(&self, action: &Value) -> Result<VoidResult, WorkerError>;

    /// Perform `action`, producing side effects. Lazily materialises the
    /// worker's isolation boundary on first call.
    async fn execute(&self, action: &Value) -> Result<ExecutionResult, WorkerError>;

    /// Advisory hook with no mandated semantics (§9 design note): workers may
    /// use outcome feedback to adjust internal behaviour, or treat this as a
    /// no-op.
    async fn evolve(&self, feedback: &Value) -> Result<(), WorkerError>;

    /// Release any container/process resources. Must be idempotent.
    async fn cleanup(&self) -> Result<(), WorkerError>;
}

/// Enforce the void-purity invariant (§8): panics the caller's operation on
/// a contract breach rather than returning a recoverable error, matching the
/// "fatal invariant breach" classification of §7.
pub fn assert_void_purity(worker_id: &str, result: &VoidResult) -> Result<(), WorkerError> {
    if result.side_effect_occurred {
        return Err(WorkerError::WitnessContract { worker_id: worker_id.to_string() });
    }
    Ok(())
}

/// Enforce the execute-honesty invariant (§8).
pub fn assert_execute_honesty(worker_id: &str, result: &ExecutionResult) -> Result<(), WorkerError> {
    if result.success && !result.side_effect_occurred {
        return Err(WorkerError::ExecuteContract { worker_id: worker_id.to_string() });
    }
    Ok(())
}
