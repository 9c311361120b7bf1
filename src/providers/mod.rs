//! Agent provider abstraction (§4.G): injects external reasoning engines as
//! graph nodes. Every provider owns exactly one `role` and writes back
//! `{role}_output`, `{role}_session_id`, and `{role}_tokens` into the field
//! it owns, per the session-continuity contract below.

pub mod chat_endpoint;
pub mod cli_subprocess;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::channels::{PartialUpdate, StateSnapshot};

pub use chat_endpoint::ChatEndpointProvider;
pub use cli_subprocess::CliSubprocessProvider;

/// Token/cost accounting returned alongside a provider's output, written to
/// `{role}_tokens` as a JSON object.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub cost: f64,
    pub turns: u32,
    pub duration_ms: u64,
    pub duration_api_ms: u64,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    #[error("provider {provider} timed out after {elapsed_ms}ms")]
    #[diagnostic(code(stepgraph::provider::timeout))]
    Timeout { provider: &'static str, elapsed_ms: u64 },

    #[error("provider {provider} failed: {message}")]
    #[diagnostic(code(stepgraph::provider::failure))]
    Failure { provider: &'static str, message: String },

    #[error("provider {provider} returned an unparseable response: {message}")]
    #[diagnostic(code(stepgraph::provider::response))]
    Response { provider: &'static str, message: String },
}

/// Implemented by every agent backend splice-able into a graph (§4.F agent
/// injection). A provider is stateless between calls; session continuity is
/// carried entirely through the `{role}_session_id` state field.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Run `task` against the current snapshot, returning only the fields
    /// this provider owns (`{role}_output`, `{role}_session_id`,
    /// `{role}_tokens`).
    async fn execute_task(&self, task: &str, state: &StateSnapshot) -> Result<PartialUpdate, ProviderError>;

    /// Stable identifier, e.g. `"chat_endpoint"`, `"cli_subprocess"`.
    fn name(&self) -> &'static str;

    /// Arbitrary provider metadata surfaced on observability spans (model,
    /// endpoint, container, etc.) — never secrets.
    fn metadata(&self) -> serde_json::Map<String, Value>;

    /// Estimate USD cost for an exchange, given token counts. Self-hosted or
    /// CLI-metered providers may return `0.0` and rely on their own
    /// response-provided cost instead.
    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64;

    /// Role this provider instance is bound to in the graph (used to derive
    /// field names).
    fn role(&self) -> &str;
}

/// Read `{role}_session_id` from the pre-call state, the session-continuity
/// read half of §4.G.
pub fn read_session_id(role: &str, state: &StateSnapshot) -> Option<String> {
    state
        .get(&format!("{role}_session_id"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Build the standard `{role}_output`/`{role}_session_id`/`{role}_tokens`
/// partial update a provider returns.
pub fn build_output(role: &str, output: impl Into<Value>, session_id: Option<String>, tokens: TokenUsage) -> PartialUpdate {
    PartialUpdate::new()
        .with(format!("{role}_output"), output.into())
        .with(format!("{role}_session_id"), session_id.map_or(Value::Null, Value::from))
        .with(
            format!("{role}_tokens"),
            serde_json::to_value(tokens).unwrap_or(Value::Null),
        )
}
