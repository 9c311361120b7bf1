//! Linear-graph execution and checkpoint-count scenarios.

use std::sync::Arc;

use async_trait::async_trait;
use stepgraph::channels::{ChannelError, PartialUpdate, Schema, State, StateSnapshot};
use stepgraph::event_bus::EventBus;
use stepgraph::graphs::GraphBuilder;
use stepgraph::node::{Node, NodeContext, NodeError};
use stepgraph::runtimes::{AppRunner, InMemoryCheckpointer};
use stepgraph::types::NodeKind;

struct Process;

#[async_trait]
impl Node for Process {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        let input = snapshot.get("input").and_then(|v| v.as_str()).ok_or(NodeError::MissingInput { what: "input" })?;
        Ok(PartialUpdate::new().with("output", format!("Processed: {input}")))
    }
}

fn runner_for(app: stepgraph::app::App) -> AppRunner {
    AppRunner::with_checkpointer_and_bus(app, Arc::new(InMemoryCheckpointer::new()), Arc::new(EventBus::default()))
}

#[tokio::test]
async fn linear_graph_produces_expected_output_and_one_checkpoint() {
    let app = GraphBuilder::new()
        .with_schema(Schema::new().last_value("input").last_value("output"))
        .add_node("process", Process)
        .set_entry("process")
        .add_edge(NodeKind::Start, NodeKind::Custom("process".into()))
        .add_edge(NodeKind::Custom("process".into()), NodeKind::End)
        .compile()
        .unwrap();

    let mut runner = runner_for(app);
    let mut initial = State::new();
    initial.set("input", "x");
    runner.create_session("linear".into(), initial).await.unwrap();
    let final_state = runner.run_until_complete("linear").await.unwrap();

    assert_eq!(final_state.get("input").unwrap(), "x");
    assert_eq!(final_state.get("output").unwrap(), "Processed: x");
}

struct SetField {
    field: &'static str,
    source: &'static str,
    prefix: &'static str,
}

#[async_trait]
impl Node for SetField {
    async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        let value = snapshot.get(self.source).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        Ok(PartialUpdate::new().with(self.field, format!("{}{value}", self.prefix)))
    }
}

#[tokio::test]
async fn sequential_pipeline_field_ownership_and_three_checkpoints() {
    let app = GraphBuilder::new()
        .with_schema(
            Schema::new()
                .last_value("topic")
                .last_value("research_output")
                .last_value("writing_output")
                .last_value("review_output"),
        )
        .add_node("research", SetField { field: "research_output", source: "topic", prefix: "research:" })
        .add_node("write", SetField { field: "writing_output", source: "research_output", prefix: "write:" })
        .add_node("review", SetField { field: "review_output", source: "writing_output", prefix: "review:" })
        .set_entry("research")
        .add_edge(NodeKind::Start, NodeKind::Custom("research".into()))
        .add_edge(NodeKind::Custom("research".into()), NodeKind::Custom("write".into()))
        .add_edge(NodeKind::Custom("write".into()), NodeKind::Custom("review".into()))
        .add_edge(NodeKind::Custom("review".into()), NodeKind::End)
        .compile()
        .unwrap();

    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let mut runner = AppRunner::with_checkpointer_and_bus(app, checkpointer.clone(), Arc::new(EventBus::default()));
    let mut initial = State::new();
    initial.set("topic", "T");
    runner.create_session("pipeline".into(), initial).await.unwrap();
    let final_state = runner.run_until_complete("pipeline").await.unwrap();

    assert_eq!(final_state.get("research_output").unwrap(), "research:T");
    assert_eq!(final_state.get("writing_output").unwrap(), "write:research:T");
    assert_eq!(final_state.get("review_output").unwrap(), "review:write:research:T");

    let checkpoints = checkpointer.list("pipeline").await.unwrap();
    assert_eq!(checkpoints.len(), 3);
}

struct EmitEvent {
    id: &'static str,
}

#[async_trait]
impl Node for EmitEvent {
    async fn run(&self, _snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        Ok(PartialUpdate::new().with("events", serde_json::json!([self.id])))
    }
}

#[tokio::test]
async fn parallel_fanout_with_append_merges_in_node_id_order() {
    let app = GraphBuilder::new()
        .with_schema(Schema::new().append("events"))
        .add_node("a", EmitEvent { id: "a" })
        .add_node("b", EmitEvent { id: "b" })
        .set_entry("a")
        .add_edge(NodeKind::Start, NodeKind::Custom("a".into()))
        .add_edge(NodeKind::Start, NodeKind::Custom("b".into()))
        .add_edge(NodeKind::Custom("a".into()), NodeKind::End)
        .add_edge(NodeKind::Custom("b".into()), NodeKind::End)
        .compile()
        .unwrap();

    let mut runner = runner_for(app);
    runner.create_session("fanout".into(), State::new()).await.unwrap();
    let final_state = runner.run_until_complete("fanout").await.unwrap();

    assert_eq!(final_state.get("events").unwrap(), &serde_json::json!(["a", "b"]));
}

#[tokio::test]
async fn duplicate_write_on_last_value_field_fails_without_checkpoint() {
    let app = GraphBuilder::new()
        .with_schema(Schema::new().last_value("events"))
        .add_node("a", EmitEvent { id: "a" })
        .add_node("b", EmitEvent { id: "b" })
        .set_entry("a")
        .add_edge(NodeKind::Start, NodeKind::Custom("a".into()))
        .add_edge(NodeKind::Start, NodeKind::Custom("b".into()))
        .add_edge(NodeKind::Custom("a".into()), NodeKind::End)
        .add_edge(NodeKind::Custom("b".into()), NodeKind::End)
        .compile()
        .unwrap();

    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let mut runner = AppRunner::with_checkpointer_and_bus(app, checkpointer.clone(), Arc::new(EventBus::default()));
    runner.create_session("dup".into(), State::new()).await.unwrap();
    let err = runner.run_step("dup").await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("duplicate write") || format!("{err:?}").contains("DuplicateWrite"));

    assert!(checkpointer.list("dup").await.unwrap().is_empty());
}

#[test]
fn channel_error_names_both_contributing_nodes() {
    let schema = Schema::new().last_value("events");
    let current = State::new();
    let updates = vec![
        (NodeKind::Custom("b".into()), PartialUpdate::new().with("events", "b")),
        (NodeKind::Custom("a".into()), PartialUpdate::new().with("events", "a")),
    ];
    let err = stepgraph::channels::compose(&schema, &current, &updates).unwrap_err();
    match err {
        ChannelError::DuplicateWrite { field, node_ids } => {
            assert_eq!(field, "events");
            assert_eq!(node_ids, vec!["Custom:a".to_string(), "Custom:b".to_string()]);
        }
        other => panic!("expected DuplicateWrite, got {other:?}"),
    }
}
