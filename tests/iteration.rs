//! Iterative convergence: a node that loops back to itself via a router
//! until a convergence flag trips or a loop ceiling is reached.

use std::sync::Arc;

use async_trait::async_trait;
use stepgraph::channels::{PartialUpdate, Schema, State, StateSnapshot};
use stepgraph::event_bus::EventBus;
use stepgraph::graphs::GraphBuilder;
use stepgraph::node::{Node, NodeContext, NodeError};
use stepgraph::runtimes::{AppRunner, InMemoryCheckpointer};
use stepgraph::types::NodeKind;

/// Reads the current `iteration` (defaulting to 0), advances it by one, and
/// sets `converged` once the *pre-increment* value reaches 2 — so
/// convergence is observed one super-step after `iteration` itself reaches 2.
struct Increment;

#[async_trait]
impl Node for Increment {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        let current = snapshot.get("iteration").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(PartialUpdate::new()
            .with("iteration", current + 1)
            .with("converged", current == 2))
    }
}

fn router(state: &StateSnapshot) -> String {
    let converged = state.get("converged").and_then(|v| v.as_bool()).unwrap_or(false);
    let iteration = state.get("iteration").and_then(|v| v.as_i64()).unwrap_or(0);
    if !converged && iteration < 3 {
        "loop".to_string()
    } else {
        "end".to_string()
    }
}

#[tokio::test]
async fn converges_after_three_loop_checkpoints() {
    let app = GraphBuilder::new()
        .with_schema(Schema::new().last_value("iteration").last_value("converged"))
        .add_node("step", Increment)
        .set_entry("step")
        .add_edge(NodeKind::Start, NodeKind::Custom("step".into()))
        .add_conditional_edges(
            NodeKind::Custom("step".into()),
            Arc::new(router),
            [
                ("loop".to_string(), NodeKind::Custom("step".into())),
                ("end".to_string(), NodeKind::End),
            ],
        )
        .compile()
        .unwrap();

    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let mut runner = AppRunner::with_checkpointer_and_bus(app, checkpointer.clone(), Arc::new(EventBus::default()));
    runner.create_session("loop".into(), State::new()).await.unwrap();
    let final_state = runner.run_until_complete("loop").await.unwrap();

    assert_eq!(final_state.get("iteration").unwrap(), &serde_json::json!(3));
    assert_eq!(final_state.get("converged").unwrap(), &serde_json::json!(true));

    let checkpoints = checkpointer.list("loop").await.unwrap();
    assert_eq!(checkpoints.len(), 3, "two loop checkpoints plus the final one");
}

#[tokio::test]
async fn superstep_ceiling_halts_a_runaway_loop() {
    fn always_loop(_state: &StateSnapshot) -> String {
        "loop".to_string()
    }

    let app = GraphBuilder::new()
        .with_schema(Schema::new().last_value("iteration"))
        .add_node("step", Increment)
        .set_entry("step")
        .add_edge(NodeKind::Start, NodeKind::Custom("step".into()))
        .add_conditional_edges(
            NodeKind::Custom("step".into()),
            Arc::new(always_loop),
            [
                ("loop".to_string(), NodeKind::Custom("step".into())),
                ("end".to_string(), NodeKind::End),
            ],
        )
        .compile()
        .unwrap();

    let mut runner = AppRunner::with_checkpointer_and_bus(
        app,
        Arc::new(InMemoryCheckpointer::new()),
        Arc::new(EventBus::default()),
    )
    .with_max_supersteps(5);
    runner.create_session("runaway".into(), State::new()).await.unwrap();

    let err = runner.run_until_complete("runaway").await.unwrap_err();
    assert!(err.to_string().contains("super-step ceiling"));
}
