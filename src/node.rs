//! Node execution framework: the [`Node`] trait, its execution context, and
//! the error taxonomy nodes raise.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::channels::{PartialUpdate, StateSnapshot};
use crate::event_bus::{Event, EventEmitter};
use crate::types::NodeRole;

/// Core trait defining an executable workflow node.
///
/// A node receives a read-only [`StateSnapshot`] of the pre-barrier state
/// and an execution [`NodeContext`], performs its work, and returns a
/// [`PartialUpdate`] naming only the fields it owns. Nodes dispatched in the
/// same super-step never observe one another's writes; the scheduler
/// serialises their combined effect at the barrier (§4.C).
///
/// # Examples
///
/// ```rust,no_run
/// use stepgraph::node::{Node, NodeContext, NodeError};
/// use stepgraph::channels::{PartialUpdate, StateSnapshot};
/// use async_trait::async_trait;
///
/// struct Uppercase;
///
/// #[async_trait]
/// impl Node for Uppercase {
///     async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
///         let input = snapshot
///             .get("input")
///             .and_then(|v| v.as_str())
///             .ok_or(NodeError::MissingInput { what: "input" })?;
///         ctx.emit_diagnostic("uppercase", "transforming input")?;
///         Ok(PartialUpdate::new().with("output", input.to_uppercase()))
///     }
/// }
/// ```
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute this node against a pre-barrier state snapshot.
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError>;
}

/// Execution context handed to a node for the duration of one super-step.
#[derive(Clone, Debug)]
pub struct NodeContext {
    /// The node's identifier, as it appears in the compiled graph.
    pub node_id: String,
    /// Which kind of node this is (`user`, `agent`, `prep`).
    pub role: NodeRole,
    /// Current super-step number.
    pub step: u64,
    /// Sink for observability events.
    pub event_emitter: Arc<dyn EventEmitter>,
}

impl NodeContext {
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), NodeContextError> {
        self.emit_node(scope, message)
    }

    pub fn emit_node(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), NodeContextError> {
        self.emit_event(Event::node_message_with_meta(
            self.node_id.clone(),
            self.step,
            scope,
            message,
        ))
    }

    pub fn emit_diagnostic(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), NodeContextError> {
        self.emit_event(Event::diagnostic(scope, message))
    }

    /// Emit a provider streaming chunk; used by agent nodes (§4.G) to surface
    /// incremental output before the final `PartialUpdate` is returned.
    pub fn emit_provider_chunk(
        &self,
        stream_id: Option<String>,
        chunk: impl Into<String>,
        metadata: Option<FxHashMap<String, serde_json::Value>>,
    ) -> Result<(), NodeContextError> {
        self.emit_event(Event::provider_chunk(
            Some(self.node_id.clone()),
            stream_id,
            chunk,
            metadata.unwrap_or_default(),
        ))
    }

    fn emit_event(&self, event: Event) -> Result<(), NodeContextError> {
        self.event_emitter
            .emit(event)
            .map_err(|_| NodeContextError::EventBusUnavailable)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum NodeContextError {
    #[error("failed to emit event: event bus unavailable")]
    #[diagnostic(
        code(stepgraph::node::event_bus_unavailable),
        help("The event bus may be disconnected or at capacity.")
    )]
    EventBusUnavailable,
}

/// Fatal errors a node may raise to halt execution (§7 node-level errors).
///
/// Recoverable problems should instead be folded into the node's own
/// `PartialUpdate` (e.g. an `errors` Append field) and returned as `Ok`.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(stepgraph::node::missing_input),
        help("Check that an earlier node produced the required field: {what}.")
    )]
    MissingInput { what: &'static str },

    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(stepgraph::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error(transparent)]
    #[diagnostic(code(stepgraph::node::serde_json))]
    Serde(#[from] serde_json::Error),

    #[error("validation failed: {0}")]
    #[diagnostic(code(stepgraph::node::validation))]
    ValidationFailed(String),

    #[error("event bus error: {0}")]
    #[diagnostic(code(stepgraph::node::event_bus))]
    EventBus(#[from] NodeContextError),
}
