//! The compiled, executable graph (§4.B output / §4.F entry point).
//!
//! An [`App`] is produced exclusively by [`crate::graphs::GraphBuilder::compile`].
//! It carries no execution state itself; running it spins up a fresh
//! [`crate::runtimes::AppRunner`] session.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::channels::{Schema, State};
use crate::graphs::ConditionalEdge;
use crate::node::Node;
use crate::runtimes::runner::RunnerError;
use crate::runtimes::runtime_config::RuntimeConfig;
use crate::types::{NodeKind, NodeRole};

/// A compiled workflow graph, ready to execute.
///
/// # Examples
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use stepgraph::channels::{PartialUpdate, Schema, State, StateSnapshot};
/// use stepgraph::graphs::GraphBuilder;
/// use stepgraph::node::{Node, NodeContext, NodeError};
/// use stepgraph::types::NodeKind;
///
/// struct Echo;
///
/// #[async_trait]
/// impl Node for Echo {
///     async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
///         Ok(PartialUpdate::new().with("output", snapshot.get("input").cloned().unwrap_or_default()))
///     }
/// }
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let app = GraphBuilder::new()
///     .with_schema(Schema::new().last_value("input").last_value("output"))
///     .add_node("process", Echo)
///     .set_entry("process")
///     .add_edge(NodeKind::Start, NodeKind::Custom("process".into()))
///     .add_edge(NodeKind::Custom("process".into()), NodeKind::End)
///     .compile()?;
///
/// let mut initial = State::new();
/// initial.set("input", "hello");
/// let final_state = app.invoke(initial).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct App {
    nodes: FxHashMap<NodeKind, Arc<dyn Node>>,
    node_roles: FxHashMap<NodeKind, NodeRole>,
    edges: FxHashMap<NodeKind, Vec<NodeKind>>,
    conditional_edges: Vec<ConditionalEdge>,
    entry: NodeKind,
    schema: Schema,
    runtime_config: RuntimeConfig,
}

impl App {
    /// Internal (crate) factory used by [`crate::graphs::compilation::compile`].
    pub(crate) fn from_parts(
        nodes: FxHashMap<NodeKind, Arc<dyn Node>>,
        node_roles: FxHashMap<NodeKind, NodeRole>,
        edges: FxHashMap<NodeKind, Vec<NodeKind>>,
        conditional_edges: Vec<ConditionalEdge>,
        entry: NodeKind,
        schema: Schema,
        runtime_config: RuntimeConfig,
    ) -> Self {
        App {
            nodes,
            node_roles,
            edges,
            conditional_edges,
            entry,
            schema,
            runtime_config,
        }
    }

    #[must_use]
    pub fn nodes(&self) -> &FxHashMap<NodeKind, Arc<dyn Node>> {
        &self.nodes
    }

    #[must_use]
    pub fn node_roles(&self) -> &FxHashMap<NodeKind, NodeRole> {
        &self.node_roles
    }

    #[must_use]
    pub fn edges(&self) -> &FxHashMap<NodeKind, Vec<NodeKind>> {
        &self.edges
    }

    #[must_use]
    pub fn conditional_edges(&self) -> &[ConditionalEdge] {
        &self.conditional_edges
    }

    #[must_use]
    pub fn entry(&self) -> &NodeKind {
        &self.entry
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Execute the graph from `initial` to completion, creating a fresh
    /// session (§4.F). For resumable multi-turn execution, construct an
    /// [`crate::runtimes::AppRunner`] directly and manage the session id
    /// yourself.
    pub async fn invoke(&self, initial: State) -> Result<State, RunnerError> {
        use crate::runtimes::AppRunner;

        let session_id = self
            .runtime_config
            .session_id
            .clone()
            .unwrap_or_else(|| "invoke".to_string());

        let mut runner = AppRunner::new(self.clone()).await?;
        runner.create_session(session_id.clone(), initial).await?;
        runner.run_until_complete(&session_id).await
    }
}
