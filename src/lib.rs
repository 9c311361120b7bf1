//! # stepgraph: graph-driven workflow runtime
//!
//! stepgraph runs declarative graphs of async nodes as a sequence of
//! super-steps: every node in the current frontier is dispatched
//! concurrently, the scheduler barriers on all of them, their partial
//! updates are composed into a new [`channels::State`] by the channel's
//! reducer, and the next frontier is computed by following edges and
//! evaluating routers against the composed state.
//!
//! ## Core concepts
//!
//! - **Nodes** ([`node::Node`]) — async units of work that read a
//!   [`channels::StateSnapshot`] and return a [`channels::PartialUpdate`]
//! - **Channels** ([`channels::State`]) — versioned, schema-typed state,
//!   merged per-field by a [`types::ReducerKind`] (`LastValue` or `Append`)
//! - **Graphs** ([`graphs::GraphBuilder`]) — declarative node/edge/router
//!   definitions, compiled into an [`app::App`]
//! - **Scheduler** ([`schedulers::Scheduler`]) — concurrent super-step
//!   execution with cancellation and an optional loop ceiling
//! - **Runtime** ([`runtimes::AppRunner`]) — session lifecycle, checkpoint
//!   persistence, and resume-from-checkpoint
//!
//! ## Quick start
//!
//! ```
//! use async_trait::async_trait;
//! use stepgraph::channels::{PartialUpdate, Schema, State, StateSnapshot};
//! use stepgraph::graphs::GraphBuilder;
//! use stepgraph::node::{Node, NodeContext, NodeError};
//! use stepgraph::types::NodeKind;
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl Node for Greet {
//!     async fn run(&self, _snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
//!         let mut update = PartialUpdate::new();
//!         update.set("greeting", serde_json::json!("hello"));
//!         Ok(update)
//!     }
//! }
//!
//! let app = GraphBuilder::new()
//!     .with_schema(Schema::new().last_value("greeting"))
//!     .add_node("greet", Greet)
//!     .set_entry("greet")
//!     .add_edge(NodeKind::Start, NodeKind::Custom("greet".into()))
//!     .add_edge(NodeKind::Custom("greet".into()), NodeKind::End)
//!     .compile()
//!     .unwrap();
//! let _ = State::new();
//! let _ = app;
//! ```
//!
//! ## Running a graph end to end
//!
//! ```rust,no_run
//! use stepgraph::app::App;
//! use stepgraph::channels::State;
//! use stepgraph::runtimes::AppRunner;
//!
//! # async fn example(app: App) -> Result<(), Box<dyn std::error::Error>> {
//! let mut runner = AppRunner::new(app).await?;
//! runner.create_session("session-1".to_string(), State::new()).await?;
//! let final_state = runner.run_until_complete("session-1").await?;
//! # let _ = final_state;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`app`] — the compiled graph (nodes, edges, routers, schema)
//! - [`channels`] — state, schema, reducers, and the barrier-merge function
//! - [`node`] — the `Node` trait and execution context
//! - [`graphs`] — graph construction, compilation, and iteration
//! - [`schedulers`] — the super-step loop
//! - [`runtimes`] — session runtime, checkpointing, and configuration
//! - [`event_bus`] — the observability event stream and pluggable sinks
//! - [`telemetry`] — human-readable rendering of events and error chains
//! - [`types`] — shared identifiers and small enums (`NodeKind`, `NodeRole`, `ReducerKind`)
//! - [`utils`] — id generation and JSON helpers

pub mod app;
pub mod channels;
pub mod event_bus;
pub mod executor;
pub mod graphs;
pub mod node;
pub mod observability;
pub mod providers;
pub mod runtimes;
pub mod schedulers;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod workers;
