//! Super-step scheduler (§4.C): dispatches one frontier's nodes concurrently,
//! barriers on all of them, composes their updates, and computes the next
//! frontier by following unconditional edges and evaluating routers.

use std::sync::Arc;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use indexmap::IndexSet;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::channels::{compose, ChannelError, PartialUpdate, State};
use crate::event_bus::EventEmitter;
use crate::node::{NodeContext, NodeError};
use crate::types::NodeKind;

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("node {node} failed: {source}")]
    #[diagnostic(code(stepgraph::scheduler::node_failed))]
    NodeFailed {
        node: NodeKind,
        #[source]
        source: NodeError,
    },

    #[error("super-step cancelled")]
    #[diagnostic(code(stepgraph::scheduler::cancelled))]
    Cancelled,

    #[error("router at {from} returned label {label:?}, which is not in its label map")]
    #[diagnostic(code(stepgraph::scheduler::router_label))]
    RouterLabel { from: NodeKind, label: String },

    #[error("frontier referenced unregistered node {0}")]
    #[diagnostic(code(stepgraph::scheduler::unknown_node))]
    UnknownNode(NodeKind),

    #[error("super-step ceiling of {limit} exceeded")]
    #[diagnostic(
        code(stepgraph::scheduler::superstep_limit),
        help("Check for an unintended routing cycle, or raise the configured ceiling.")
    )]
    SuperstepLimitExceeded { limit: u64 },

    #[error(transparent)]
    #[diagnostic(code(stepgraph::scheduler::channel))]
    Channel(#[from] ChannelError),
}

/// Result of running one super-step to completion.
pub struct SuperstepOutcome {
    pub ran_nodes: Vec<NodeKind>,
    pub state: State,
    pub next_frontier: Vec<NodeKind>,
}

/// Drives one execution's super-step loop. Cheap to construct; carries only
/// the cancellation token and the optional loop ceiling (§4.C Loops).
#[derive(Clone)]
pub struct Scheduler {
    cancellation: CancellationToken,
    max_supersteps: Option<u64>,
}

impl Scheduler {
    #[must_use]
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            max_supersteps: None,
        }
    }

    #[must_use]
    pub fn with_max_supersteps(mut self, max: u64) -> Self {
        self.max_supersteps = Some(max);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Check the configured ceiling against the step about to run.
    pub fn check_superstep_limit(&self, step: u64) -> Result<(), SchedulerError> {
        if let Some(limit) = self.max_supersteps {
            if step >= limit {
                return Err(SchedulerError::SuperstepLimitExceeded { limit });
            }
        }
        Ok(())
    }

    /// Run one super-step: dispatch `frontier` concurrently, barrier, compose,
    /// and compute the next frontier (§4.C steps a-e).
    pub async fn superstep(
        &self,
        app: &App,
        frontier: &[NodeKind],
        state: &State,
        step: u64,
        event_emitter: Arc<dyn EventEmitter>,
    ) -> Result<SuperstepOutcome, SchedulerError> {
        self.check_superstep_limit(step)?;

        let snapshot = state.snapshot();
        let mut in_flight = FuturesUnordered::new();

        for node_kind in frontier {
            let node = app
                .nodes()
                .get(node_kind)
                .cloned()
                .ok_or_else(|| SchedulerError::UnknownNode(node_kind.clone()))?;
            let role = app
                .node_roles()
                .get(node_kind)
                .copied()
                .unwrap_or(crate::types::NodeRole::User);
            let ctx = NodeContext {
                node_id: node_kind.encode(),
                role,
                step,
                event_emitter: Arc::clone(&event_emitter),
            };
            let snapshot = snapshot.clone();
            let node_kind = node_kind.clone();
            in_flight.push(async move {
                let result = node.run(snapshot, ctx).await;
                (node_kind, result)
            });
        }

        let mut updates: Vec<(NodeKind, PartialUpdate)> = Vec::with_capacity(frontier.len());
        loop {
            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => {
                    return Err(SchedulerError::Cancelled);
                }
                next = in_flight.next() => {
                    match next {
                        Some((node_kind, Ok(update))) => updates.push((node_kind, update)),
                        Some((node_kind, Err(source))) => {
                            return Err(SchedulerError::NodeFailed { node: node_kind, source });
                        }
                        None => break,
                    }
                }
            }
        }

        let next_state = compose(app.schema(), state, &updates)?;
        let next_frontier = next_frontier(app, frontier, &next_state)?;

        Ok(SuperstepOutcome {
            ran_nodes: frontier.to_vec(),
            state: next_state,
            next_frontier,
        })
    }
}

/// Compute the frontier that follows `ran` (§4.C step e): every unconditional
/// successor, plus for each conditional edge from a node in `ran`, the
/// successor labelled by evaluating its router against `state`. `End`
/// successors terminate their branch and are never included.
pub fn next_frontier(
    app: &App,
    ran: &[NodeKind],
    state: &State,
) -> Result<Vec<NodeKind>, SchedulerError> {
    let snapshot = state.snapshot();
    let mut next: IndexSet<NodeKind> = IndexSet::new();

    for node_kind in ran {
        if let Some(successors) = app.edges().get(node_kind) {
            for successor in successors {
                if !successor.is_end() {
                    next.insert(successor.clone());
                }
            }
        }
        for edge in app.conditional_edges() {
            if &edge.from != node_kind {
                continue;
            }
            let label = (edge.router)(&snapshot);
            let target = edge.labels.get(&label).ok_or_else(|| SchedulerError::RouterLabel {
                from: node_kind.clone(),
                label: label.clone(),
            })?;
            if !target.is_end() {
                next.insert(target.clone());
            }
        }
    }

    Ok(next.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Schema, StateSnapshot};
    use crate::graphs::{ConditionalEdge, GraphBuilder};
    use crate::node::Node;
    use async_trait::async_trait;
    use indexmap::IndexMap;

    struct Passthrough;

    #[async_trait]
    impl Node for Passthrough {
        async fn run(&self, _snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
            Ok(PartialUpdate::new())
        }
    }

    fn linear_app() -> App {
        GraphBuilder::new()
            .with_schema(Schema::new())
            .add_node("a", Passthrough)
            .set_entry("a")
            .add_edge(NodeKind::Start, NodeKind::Custom("a".into()))
            .add_edge(NodeKind::Custom("a".into()), NodeKind::End)
            .compile()
            .unwrap()
    }

    #[test]
    fn next_frontier_drops_end_successors() {
        let app = linear_app();
        let state = State::new();
        let frontier = next_frontier(&app, &[NodeKind::Custom("a".into())], &state).unwrap();
        assert!(frontier.is_empty());
    }

    #[test]
    fn next_frontier_follows_router_label() {
        let app = GraphBuilder::new()
            .with_schema(Schema::new().last_value("route"))
            .add_node("a", Passthrough)
            .add_node("b", Passthrough)
            .set_entry("a")
            .add_edge(NodeKind::Start, NodeKind::Custom("a".into()))
            .add_conditional_edges(
                NodeKind::Custom("a".into()),
                Arc::new(|_s: &StateSnapshot| "go".to_string()),
                [("go".to_string(), NodeKind::Custom("b".into()))],
            )
            .add_edge(NodeKind::Custom("b".into()), NodeKind::End)
            .compile()
            .unwrap();

        let state = State::new();
        let frontier = next_frontier(&app, &[NodeKind::Custom("a".into())], &state).unwrap();
        assert_eq!(frontier, vec![NodeKind::Custom("b".into())]);
    }

    #[test]
    fn next_frontier_unknown_label_errors() {
        let edge = ConditionalEdge::new(
            NodeKind::Custom("a".into()),
            Arc::new(|_s: &StateSnapshot| "missing".to_string()),
            IndexMap::new(),
        );
        let app = GraphBuilder::new()
            .with_schema(Schema::new())
            .add_node("a", Passthrough)
            .set_entry("a")
            .add_edge(NodeKind::Start, NodeKind::Custom("a".into()))
            .add_conditional_edges(edge.from.clone(), edge.router.clone(), edge.labels.clone())
            .compile()
            .unwrap();

        let state = State::new();
        let err = next_frontier(&app, &[NodeKind::Custom("a".into())], &state).unwrap_err();
        assert!(matches!(err, SchedulerError::RouterLabel { .. }));
    }
}
