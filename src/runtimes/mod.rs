//! Workflow runtime infrastructure: session management and state persistence.
//!
//! The runtime layer abstracts over pluggable checkpointer backends while
//! giving [`AppRunner`] a single stepwise execution API.
//!
//! # Architecture
//!
//! - [`AppRunner`] — orchestrates one or more sessions of a compiled [`crate::app::App`]
//! - [`Checkpointer`] — trait for pluggable state persistence (§4.D)
//! - [`RuntimeConfig`] — per-execution checkpointer/event-bus selection (§6)
//! - [`FileConfig`] — per-environment config file loader with `${NAME}` substitution (§6)
//!
//! # Persistence backends
//!
//! - [`InMemoryCheckpointer`] — volatile, used when nothing else is configured
//! - [`EmbeddedCheckpointer`] — SQLite-backed, single process (`sqlite` feature)
//! - [`SqlCheckpointer`] — Postgres-backed, multi-process (`postgres` feature)
//! - [`ResilientCheckpointer`] — SQL primary with bounded retries and an
//!   embedded-KV fallback (both features; the canonical choice, §9)
//!
//! # Usage
//!
//! ```rust,no_run
//! use stepgraph::app::App;
//! use stepgraph::runtimes::AppRunner;
//! use stepgraph::channels::State;
//! # async fn example(app: App) -> Result<(), Box<dyn std::error::Error>> {
//! let mut runner = AppRunner::new(app).await?;
//! runner.create_session("session_1".to_string(), State::new()).await?;
//! let final_state = runner.run_until_complete("session_1").await?;
//! # Ok(())
//! # }
//! ```

pub mod checkpointer;
#[cfg(feature = "sqlite")]
pub mod checkpointer_embedded;
#[cfg(feature = "postgres")]
pub mod checkpointer_sql;
pub mod config;
pub mod runner;
pub mod runtime_config;

pub use checkpointer::{
    Checkpoint, Checkpointer, CheckpointerError, CheckpointerType, InMemoryCheckpointer,
    ResilientCheckpointer, Write,
};
#[cfg(feature = "sqlite")]
pub use checkpointer_embedded::EmbeddedCheckpointer;
#[cfg(feature = "postgres")]
pub use checkpointer_sql::SqlCheckpointer;
pub use config::{
    AuthFileConfig, CheckpointerFileConfig, ConfigError, FileConfig, LlmProviderFileConfig,
    ObservabilityFileConfig, ServerFileConfig,
};
pub use runner::{AppRunner, RunnerError, SessionInit};
pub use runtime_config::{EventBusConfig, RuntimeConfig, SinkConfig};
