//! Worker marketplace (§4.H–§4.K): per-journey isolated worker instances
//! behind a seven-operation protocol, gated by declarative constraint
//! enforcement and a pluggable isolation back-end.

pub mod definitions;
pub mod enforcement;
pub mod isolation;
pub mod protocol;
pub mod tool_interface;

mod factory;

pub use definitions::{
    Audit, ConstraintSpec, DefinitionError, Identity, RuntimeSpec, TrustLevel, WorkerDefinition,
};
pub use enforcement::{
    builtin_witness_registry, DefaultViolationLogger, ViolationLogger, Violation, Witness, WitnessError,
    WitnessRegistry,
};
pub use factory::{substitute_workspace, DeclarativeWorker, WorkerFactory, WorkerFactoryError, WorkerSource};
pub use isolation::{ContainerBackend, ExecOutput, HandleStatus, IsolationBackend, IsolationError, IsolationHandle, ProcessBackend};
pub use protocol::{
    Constraint, ExecutionResult, FeedbackChannel, FlowAction, Pressure, Severity, VoidResult, Worker, WorkerError,
    WorkerState,
};
pub use tool_interface::{execute_in_worker, get_worker_state, kill_worker, spawn_worker, ToolExecuteOutcome};
