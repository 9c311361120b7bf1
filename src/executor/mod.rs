//! Executor façade (§4.F): resolves a user workflow into a graph, splices
//! agent nodes from declarative config, compiles, and runs it to completion.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::app::App;
use crate::channels::{PartialUpdate, State, StateSnapshot};
use crate::graphs::{GraphBuilder, GraphCompileError};
use crate::node::{Node, NodeContext, NodeError};
use crate::providers::{AgentProvider, ProviderError};
use crate::runtimes::{AppRunner, RunnerError};
use crate::schedulers::SchedulerError;
use crate::types::NodeKind;

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    #[error("failed to load workflow module at {path}: {message}")]
    #[diagnostic(code(stepgraph::executor::module_load))]
    ModuleLoad { path: String, message: String },

    #[error("workflow at {path} exports no graph")]
    #[diagnostic(
        code(stepgraph::executor::no_graph),
        help("A WorkflowLoader must return a GraphBuilder with at least an entry node.")
    )]
    NoGraph { path: String },

    #[error("agent injection references unknown provider {provider:?} for role {role:?}")]
    #[diagnostic(code(stepgraph::executor::unknown_provider))]
    UnknownProvider { role: String, provider: String },

    #[error("checkpoint store unavailable: {message}")]
    #[diagnostic(code(stepgraph::executor::store_unavailable))]
    StoreUnavailable { message: String },

    #[error(transparent)]
    #[diagnostic(code(stepgraph::executor::compile))]
    Compile(#[from] GraphCompileError),

    #[error("execution failed{}: {source}", node.as_ref().map(|n| format!(" in node {n}")).unwrap_or_default())]
    #[diagnostic(code(stepgraph::executor::run))]
    Run {
        node: Option<NodeKind>,
        #[source]
        source: RunnerError,
    },
}

/// An `{role, provider, inject_after, inject_before?}` entry from a
/// workflow's agent config (§4.F agent injection).
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub role: String,
    pub provider: String,
    pub inject_after: NodeKind,
    pub inject_before: Option<NodeKind>,
}

impl AgentSpec {
    #[must_use]
    pub fn new(role: impl Into<String>, provider: impl Into<String>, inject_after: impl Into<NodeKind>) -> Self {
        Self {
            role: role.into(),
            provider: provider.into(),
            inject_after: inject_after.into(),
            inject_before: None,
        }
    }

    #[must_use]
    pub fn inject_before(mut self, target: impl Into<NodeKind>) -> Self {
        self.inject_before = Some(target.into());
        self
    }

    fn node_name(&self) -> NodeKind {
        NodeKind::Custom(format!("{}_agent", self.role))
    }
}

/// Resolves a workflow identifier (an opaque path, per §4.F) into an
/// uncompiled graph plus its agent config. Implementations may precompile,
/// ship plug-ins, or read a declarative description; the executor never
/// assumes host-language reflection (§9 design note).
#[async_trait]
pub trait WorkflowLoader: Send + Sync {
    async fn load(&self, path: &str) -> Result<(GraphBuilder, Vec<AgentSpec>), ExecutorError>;
}

/// In-process loader wrapping a closure that already holds a `GraphBuilder`
/// — the embedding path for callers who construct their graph directly
/// rather than through a declarative file.
pub struct ClosureWorkflowLoader<F> {
    build: F,
}

impl<F> ClosureWorkflowLoader<F>
where
    F: Fn() -> (GraphBuilder, Vec<AgentSpec>) + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

#[async_trait]
impl<F> WorkflowLoader for ClosureWorkflowLoader<F>
where
    F: Fn() -> (GraphBuilder, Vec<AgentSpec>) + Send + Sync,
{
    async fn load(&self, _path: &str) -> Result<(GraphBuilder, Vec<AgentSpec>), ExecutorError> {
        Ok((self.build)())
    }
}

/// Declarative YAML-backed loader: reads a workflow description file naming
/// an entry node and its agent specs, grounded in the config-file format of
/// §6. The graph's node bodies still come from a registered in-process
/// builder, since node logic cannot be described by data alone; this loader
/// only supplies structure (edges, entry, agent config) around it.
pub struct YamlWorkflowLoader {
    graphs: FxHashMap<String, (GraphBuilder, Vec<AgentSpec>)>,
}

impl Default for YamlWorkflowLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl YamlWorkflowLoader {
    #[must_use]
    pub fn new() -> Self {
        Self { graphs: FxHashMap::default() }
    }

    /// Register the graph structure a given workflow path should resolve to.
    /// In a full deployment this would be populated by parsing the YAML file
    /// at `path` and binding its node names to a plug-in registry; this
    /// loader takes the already-built graph directly to avoid speculative
    /// host-language reflection.
    #[must_use]
    pub fn register(mut self, path: impl Into<String>, builder: GraphBuilder, agents: Vec<AgentSpec>) -> Self {
        self.graphs.insert(path.into(), (builder, agents));
        self
    }
}

#[async_trait]
impl WorkflowLoader for YamlWorkflowLoader {
    async fn load(&self, path: &str) -> Result<(GraphBuilder, Vec<AgentSpec>), ExecutorError> {
        self.graphs.get(path).cloned().ok_or_else(|| ExecutorError::ModuleLoad {
            path: path.to_string(),
            message: "no workflow registered under this path".to_string(),
        })
    }
}

/// Wraps an [`AgentProvider`] as an ordinary graph [`Node`] so it can be
/// spliced into a builder like any user node.
struct AgentNode {
    provider: Arc<dyn AgentProvider>,
    task: String,
}

#[async_trait]
impl Node for AgentNode {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        ctx.emit_diagnostic(self.provider.name(), format!("dispatching task for role {}", self.provider.role()))
            .map_err(NodeError::EventBus)?;
        self.provider.execute_task(&self.task, &snapshot).await.map_err(|err| match err {
            ProviderError::Timeout { provider, .. } | ProviderError::Failure { provider, .. } | ProviderError::Response { provider, .. } => {
                NodeError::Provider { provider, message: err.to_string() }
            }
        })
    }
}

/// Registry mapping a provider name (from `AgentSpec::provider`) to a
/// factory producing a bound [`AgentProvider`] for a given role/task.
pub type ProviderFactory = dyn Fn(&str) -> Option<Arc<dyn AgentProvider>> + Send + Sync;

/// Splice every [`AgentSpec`] into `builder` per the three-step algorithm of
/// §4.F: build the agent node via the provider registry, wire
/// `inject_after -> {role}_agent`, then either `{role}_agent -> inject_before`
/// or `{role}_agent -> End`.
pub fn inject_agents(
    mut builder: GraphBuilder,
    specs: &[AgentSpec],
    providers: &ProviderFactory,
    task: impl Fn(&AgentSpec) -> String,
) -> Result<GraphBuilder, ExecutorError> {
    for spec in specs {
        let provider = providers(&spec.provider).ok_or_else(|| ExecutorError::UnknownProvider {
            role: spec.role.clone(),
            provider: spec.provider.clone(),
        })?;
        let node_name = spec.node_name();
        let agent_node = AgentNode { provider, task: task(spec) };

        builder = builder
            .add_node_with_role(node_name.clone(), agent_node, crate::types::NodeRole::Agent)
            .add_edge(spec.inject_after.clone(), node_name.clone());
        builder = match &spec.inject_before {
            Some(target) => builder.add_edge(node_name, target.clone()),
            None => builder.add_edge(node_name, NodeKind::End),
        };
    }
    Ok(builder)
}

/// Load, inject, compile, and run a workflow to completion (§4.F
/// `execute(path, input, thread_id?)`).
pub async fn execute(
    loader: &dyn WorkflowLoader,
    providers: &ProviderFactory,
    path: &str,
    input: State,
    thread_id: Option<&str>,
) -> Result<State, ExecutorError> {
    let (builder, specs) = loader.load(path).await?;
    if builder.node_count() == 0 {
        return Err(ExecutorError::NoGraph { path: path.to_string() });
    }

    let builder = inject_agents(builder, &specs, providers, |spec| format!("perform the {} role", spec.role))?;
    let app = builder.compile()?;

    run(&app, input, thread_id).await
}

/// Run an already-compiled [`App`] to completion under `thread_id`
/// (`"default"` if unset), surfacing node-attributed failures (§4.F).
pub async fn run(app: &App, input: State, thread_id: Option<&str>) -> Result<State, ExecutorError> {
    let thread_id = thread_id.unwrap_or("default").to_string();
    let mut runner = AppRunner::new(app.clone()).await.map_err(|err| match err {
        RunnerError::Checkpointer(source) => ExecutorError::StoreUnavailable { message: source.to_string() },
        other => to_executor_error(other),
    })?;
    runner.create_session(thread_id.clone(), input).await.map_err(to_executor_error)?;
    runner.run_until_complete(&thread_id).await.map_err(to_executor_error)
}

/// Attach the failing node id to a scheduler-level failure, surfacing it per
/// the executor's node-attributed error contract (§4.F).
fn to_executor_error(source: RunnerError) -> ExecutorError {
    let node = match &source {
        RunnerError::Scheduler(SchedulerError::NodeFailed { node, .. }) => Some(node.clone()),
        _ => None,
    };
    ExecutorError::Run { node, source }
}
