//! Fluent construction of a workflow graph (§4.B), compiled into an [`App`].

use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::app::App;
use crate::channels::Schema;
use crate::graphs::compilation::{self, GraphCompileError};
use crate::graphs::edges::{ConditionalEdge, RouterFn};
use crate::graphs::iteration::{self, EdgesIter, NodesIter};
use crate::node::Node;
use crate::runtimes::runtime_config::RuntimeConfig;
use crate::types::{NodeKind, NodeRole};

/// Builder for a workflow graph.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use stepgraph::channels::{PartialUpdate, Schema, StateSnapshot};
/// use stepgraph::graphs::GraphBuilder;
/// use stepgraph::node::{Node, NodeContext, NodeError};
/// use stepgraph::types::{NodeKind, ReducerKind};
///
/// struct Echo;
///
/// #[async_trait]
/// impl Node for Echo {
///     async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
///         let input = snapshot.get("input").cloned().unwrap_or_default();
///         Ok(PartialUpdate::new().with("output", input))
///     }
/// }
///
/// let schema = Schema::new().last_value("input").last_value("output");
/// let builder = GraphBuilder::new()
///     .with_schema(schema)
///     .add_node("process", Echo)
///     .set_entry("process")
///     .add_edge(NodeKind::Start, NodeKind::Custom("process".into()))
///     .add_edge(NodeKind::Custom("process".into()), NodeKind::End);
///
/// let app = builder.compile().unwrap();
/// assert_eq!(app.node_count(), 1);
/// ```
#[derive(Clone)]
pub struct GraphBuilder {
    nodes: FxHashMap<NodeKind, Arc<dyn Node>>,
    node_roles: FxHashMap<NodeKind, NodeRole>,
    edges: FxHashMap<NodeKind, Vec<NodeKind>>,
    conditional_edges: Vec<ConditionalEdge>,
    entry: Option<NodeKind>,
    schema: Schema,
    runtime_config: RuntimeConfig,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            node_roles: FxHashMap::default(),
            edges: FxHashMap::default(),
            conditional_edges: Vec::new(),
            entry: None,
            schema: Schema::new(),
            runtime_config: RuntimeConfig::default(),
        }
    }

    /// Register a user node (role [`NodeRole::User`]).
    #[must_use]
    pub fn add_node(self, name: impl Into<NodeKind>, node: impl Node + 'static) -> Self {
        self.add_node_with_role(name, node, NodeRole::User)
    }

    /// Register a node under an explicit [`NodeRole`]. Used by the executor
    /// (§4.F) to splice in `Agent`/`Prep` nodes.
    #[must_use]
    pub fn add_node_with_role(
        mut self,
        name: impl Into<NodeKind>,
        node: impl Node + 'static,
        role: NodeRole,
    ) -> Self {
        let name = name.into();
        self.nodes.insert(name.clone(), Arc::new(node));
        self.node_roles.insert(name, role);
        self
    }

    /// Add an unconditional edge `from -> to`.
    #[must_use]
    pub fn add_edge(mut self, from: impl Into<NodeKind>, to: impl Into<NodeKind>) -> Self {
        self.edges.entry(from.into()).or_default().push(to.into());
        self
    }

    /// Add a conditional edge: `router` is evaluated against the post-barrier
    /// state and must return a key present in `labels`.
    #[must_use]
    pub fn add_conditional_edges(
        mut self,
        from: impl Into<NodeKind>,
        router: RouterFn,
        labels: impl IntoIterator<Item = (impl Into<String>, impl Into<NodeKind>)>,
    ) -> Self {
        let labels: IndexMap<String, NodeKind> = labels
            .into_iter()
            .map(|(label, target)| (label.into(), target.into()))
            .collect();
        self.conditional_edges
            .push(ConditionalEdge::new(from.into(), router, labels));
        self
    }

    /// Set the graph's entry point. Required before [`Self::compile`].
    #[must_use]
    pub fn set_entry(mut self, name: impl Into<NodeKind>) -> Self {
        self.entry = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn with_runtime_config(mut self, runtime_config: RuntimeConfig) -> Self {
        self.runtime_config = runtime_config;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum::<usize>() + self.conditional_edges.len()
    }

    pub fn nodes(&self) -> NodesIter<'_> {
        NodesIter::new(self.nodes.keys())
    }

    pub fn edges(&self) -> EdgesIter<'_> {
        EdgesIter::new(&self.edges)
    }

    pub fn conditional_edges(&self) -> &[ConditionalEdge] {
        &self.conditional_edges
    }

    /// Deterministic (Start-first, End-last, lexicographic-tie-broken)
    /// topological ordering, ignoring conditional edges (which may loop).
    pub fn topological_sort(&self) -> Vec<NodeKind> {
        iteration::topological_sort(&self.edges)
    }

    /// Validate and compile into an executable [`App`] (§4.B validation).
    pub fn compile(self) -> Result<App, GraphCompileError> {
        compilation::compile(self)
    }

    /// Convert the current edge set to a [`petgraph`] `DiGraph`, giving access
    /// to petgraph's algorithm library (requires the `petgraph-compat` feature).
    #[cfg(feature = "petgraph-compat")]
    #[must_use]
    pub fn to_petgraph(&self) -> crate::graphs::petgraph_compat::PetgraphConversion {
        crate::graphs::petgraph_compat::to_petgraph(&self.edges)
    }

    /// Render the current edge set as a Graphviz DOT document.
    #[cfg(feature = "petgraph-compat")]
    #[must_use]
    pub fn to_dot(&self) -> String {
        crate::graphs::petgraph_compat::to_dot(&self.edges)
    }

    /// Check the current edge set for cycles using petgraph's algorithm.
    #[cfg(feature = "petgraph-compat")]
    #[must_use]
    pub fn is_cyclic_petgraph(&self) -> bool {
        crate::graphs::petgraph_compat::is_cyclic(&self.edges)
    }

    #[allow(clippy::type_complexity)]
    pub(super) fn into_parts(
        self,
    ) -> (
        FxHashMap<NodeKind, Arc<dyn Node>>,
        FxHashMap<NodeKind, NodeRole>,
        FxHashMap<NodeKind, Vec<NodeKind>>,
        Vec<ConditionalEdge>,
        Option<NodeKind>,
        Schema,
        RuntimeConfig,
    ) {
        (
            self.nodes,
            self.node_roles,
            self.edges,
            self.conditional_edges,
            self.entry,
            self.schema,
            self.runtime_config,
        )
    }
}
