//! Drives one or more sessions of a compiled [`App`] to completion (§4.C/§4.D/§4.F).
//!
//! [`AppRunner`] owns the checkpointer and event bus for its sessions; the
//! graph itself (`App`) is immutable and can be shared across many runners.
//! Each session advances one super-step at a time, persisting a checkpoint
//! after every successful super-step and never persisting one for a
//! cancelled or failed step (§4.D checkpoint chain invariant).

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::channels::State;
use crate::event_bus::{EventBus, EventStream};
use crate::schedulers::{next_frontier, Scheduler, SchedulerError, SuperstepOutcome};
use crate::types::NodeKind;
use crate::utils::id_generator::IdGenerator;

#[cfg(all(feature = "sqlite", feature = "postgres"))]
use super::checkpointer::ResilientCheckpointer;
use super::checkpointer::{Checkpoint, Checkpointer, CheckpointerError, CheckpointerType, InMemoryCheckpointer};
#[cfg(feature = "sqlite")]
use super::checkpointer_embedded::EmbeddedCheckpointer;
#[cfg(feature = "postgres")]
use super::checkpointer_sql::SqlCheckpointer;

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("no session named {session_id:?}")]
    #[diagnostic(code(stepgraph::runner::session_not_found))]
    SessionNotFound { session_id: String },

    #[error("session {session_id:?} already exists; use a distinct thread id to start a new run")]
    #[diagnostic(code(stepgraph::runner::session_exists))]
    SessionAlreadyExists { session_id: String },

    #[error(transparent)]
    #[diagnostic(code(stepgraph::runner::checkpointer))]
    Checkpointer(#[from] CheckpointerError),

    #[error(transparent)]
    #[diagnostic(code(stepgraph::runner::scheduler))]
    Scheduler(#[from] SchedulerError),
}

/// Report returned by [`AppRunner::create_session`] describing whether an
/// existing checkpoint chain was resumed (§8 Resume equivalence invariant).
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub session_id: String,
    pub resumed: bool,
    pub step: u64,
}

/// In-memory bookkeeping for one active session. The durable source of truth
/// is the checkpointer; this is just the cursor a runner keeps between calls.
struct SessionState {
    state: State,
    frontier: Vec<NodeKind>,
    step: u64,
    last_checkpoint_id: Option<String>,
}

/// Owns the checkpointer and event bus for a set of concurrently-running
/// sessions of one compiled graph.
pub struct AppRunner {
    app: App,
    checkpointer: Arc<dyn Checkpointer>,
    event_bus: Arc<EventBus>,
    scheduler: Scheduler,
    sessions: FxHashMap<String, SessionState>,
}

impl AppRunner {
    /// Build a runner from `app`'s own [`crate::runtimes::runtime_config::RuntimeConfig`]:
    /// the configured checkpointer backend (falling back to an in-memory
    /// store if none is configured) and the configured event bus.
    pub async fn new(app: App) -> Result<Self, RunnerError> {
        let checkpointer = build_checkpointer(app.runtime_config().checkpointer.as_ref()).await?;
        let event_bus = Arc::new(app.runtime_config().event_bus.build_event_bus());
        event_bus.listen_for_events();
        Ok(Self::with_checkpointer_and_bus(app, checkpointer, event_bus))
    }

    /// Build a runner with an explicit checkpointer and event bus, bypassing
    /// `app`'s configured defaults. Used by embedding callers (tests, web
    /// servers wanting per-request event isolation) that manage their own
    /// backends.
    #[must_use]
    pub fn with_checkpointer_and_bus(
        app: App,
        checkpointer: Arc<dyn Checkpointer>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            app,
            checkpointer,
            event_bus,
            scheduler: Scheduler::new(CancellationToken::new()),
            sessions: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_max_supersteps(mut self, max: u64) -> Self {
        self.scheduler = self.scheduler.with_max_supersteps(max);
        self
    }

    /// The cancellation token driving every super-step run by this runner.
    /// Cancel it to abort in-flight sessions; no checkpoint is written for a
    /// cancelled super-step.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.scheduler.cancellation().clone()
    }

    /// Subscribe to this runner's event stream.
    #[must_use]
    pub fn event_stream(&self) -> EventStream {
        self.event_bus.subscribe()
    }

    /// Start or resume a session under `session_id`. If the checkpointer
    /// already holds a checkpoint chain for this id, the session resumes
    /// from its head instead of using `initial` (§8 Resume equivalence:
    /// resuming and re-running from scratch reach the same final state for a
    /// deterministic graph).
    #[tracing::instrument(skip(self, initial))]
    pub async fn create_session(&mut self, session_id: String, initial: State) -> Result<SessionInit, RunnerError> {
        if self.sessions.contains_key(&session_id) {
            return Err(RunnerError::SessionAlreadyExists { session_id });
        }

        if let Some(checkpoint) = self.checkpointer.get_latest(&session_id).await? {
            let step = self.checkpointer.list(&session_id).await?.len() as u64;
            tracing::info!(session_id = %session_id, step, "resuming session from checkpoint");
            self.sessions.insert(
                session_id.clone(),
                SessionState {
                    state: checkpoint.channel_values,
                    frontier: checkpoint.next_nodes,
                    step,
                    last_checkpoint_id: Some(checkpoint.id),
                },
            );
            return Ok(SessionInit {
                session_id,
                resumed: true,
                step,
            });
        }

        let frontier = next_frontier(&self.app, &[NodeKind::Start], &initial)?;
        tracing::info!(session_id = %session_id, nodes = frontier.len(), "starting new session");
        self.sessions.insert(
            session_id.clone(),
            SessionState {
                state: initial,
                frontier,
                step: 0,
                last_checkpoint_id: None,
            },
        );
        Ok(SessionInit {
            session_id,
            resumed: false,
            step: 0,
        })
    }

    /// Run one super-step of `session_id` and persist a checkpoint on
    /// success. Returns `None` once the session's frontier is empty (every
    /// branch has reached `End`).
    #[tracing::instrument(skip(self))]
    pub async fn run_step(&mut self, session_id: &str) -> Result<Option<SuperstepOutcome>, RunnerError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| RunnerError::SessionNotFound { session_id: session_id.to_string() })?;

        if session.frontier.is_empty() {
            return Ok(None);
        }

        let outcome = self
            .scheduler
            .superstep(
                &self.app,
                &session.frontier,
                &session.state,
                session.step,
                self.event_bus.get_emitter(),
            )
            .await?;

        let checkpoint = Checkpoint::new(
            IdGenerator::new().generate_checkpoint_id(),
            session.last_checkpoint_id.clone(),
            outcome.state.clone(),
            outcome.next_frontier.clone(),
        );
        let checkpoint_id = self.checkpointer.put(session_id, checkpoint).await?;

        let session = self.sessions.get_mut(session_id).expect("checked above");
        session.state = outcome.state.clone();
        session.frontier = outcome.next_frontier.clone();
        session.step += 1;
        session.last_checkpoint_id = Some(checkpoint_id);

        Ok(Some(outcome))
    }

    /// Drive `session_id` super-step by super-step until its frontier is
    /// empty, returning the final composed state.
    #[tracing::instrument(skip(self))]
    pub async fn run_until_complete(&mut self, session_id: &str) -> Result<State, RunnerError> {
        while self.run_step(session_id).await?.is_some() {}

        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| RunnerError::SessionNotFound { session_id: session_id.to_string() })?;
        Ok(session.state.clone())
    }

    /// The current state of a known session, without advancing it.
    pub fn get_session(&self, session_id: &str) -> Option<&State> {
        self.sessions.get(session_id).map(|s| &s.state)
    }

    pub fn list_sessions(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }
}

async fn build_checkpointer(cfg: Option<&CheckpointerType>) -> Result<Arc<dyn Checkpointer>, RunnerError> {
    match cfg {
        None => Ok(Arc::new(InMemoryCheckpointer::new())),
        #[cfg(feature = "sqlite")]
        Some(CheckpointerType::Embedded { path }) => {
            let backend = EmbeddedCheckpointer::open(path).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "postgres")]
        Some(CheckpointerType::Sql { url }) => {
            let backend = SqlCheckpointer::connect(url).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(all(feature = "sqlite", feature = "postgres"))]
        Some(CheckpointerType::Resilient { sql_url, fallback_path }) => {
            let primary = SqlCheckpointer::connect(sql_url).await?;
            let fallback = EmbeddedCheckpointer::open(fallback_path).await?;
            Ok(Arc::new(ResilientCheckpointer::new(Arc::new(primary), Arc::new(fallback))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{PartialUpdate, Schema, StateSnapshot};
    use crate::graphs::GraphBuilder;
    use crate::node::{Node, NodeContext, NodeError};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Node for Echo {
        async fn run(&self, snapshot: StateSnapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
            let input = snapshot.get("input").cloned().unwrap_or_default();
            Ok(PartialUpdate::new().with("output", input))
        }
    }

    fn linear_app() -> App {
        GraphBuilder::new()
            .with_schema(Schema::new().last_value("input").last_value("output"))
            .add_node("process", Echo)
            .set_entry("process")
            .add_edge(NodeKind::Start, NodeKind::Custom("process".into()))
            .add_edge(NodeKind::Custom("process".into()), NodeKind::End)
            .compile()
            .unwrap()
    }

    #[tokio::test]
    async fn run_until_complete_produces_final_state() {
        let app = linear_app();
        let mut runner = AppRunner::with_checkpointer_and_bus(
            app,
            Arc::new(InMemoryCheckpointer::new()),
            Arc::new(EventBus::default()),
        );
        let mut initial = State::new();
        initial.set("input", "hello");
        runner.create_session("s1".into(), initial).await.unwrap();
        let final_state = runner.run_until_complete("s1").await.unwrap();
        assert_eq!(final_state.get("output").unwrap(), "hello");
    }

    #[tokio::test]
    async fn resuming_a_completed_session_returns_its_checkpointed_state() {
        let app = linear_app();
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(InMemoryCheckpointer::new());
        let mut runner = AppRunner::with_checkpointer_and_bus(
            app,
            checkpointer.clone(),
            Arc::new(EventBus::default()),
        );
        let mut initial = State::new();
        initial.set("input", "hi");
        runner.create_session("s1".into(), initial).await.unwrap();
        runner.run_until_complete("s1").await.unwrap();

        let app2 = linear_app();
        let mut runner2 = AppRunner::with_checkpointer_and_bus(
            app2,
            checkpointer,
            Arc::new(EventBus::default()),
        );
        let init = runner2.create_session("s1".into(), State::new()).await.unwrap();
        assert!(init.resumed);
        assert_eq!(runner2.get_session("s1").unwrap().get("output").unwrap(), "hi");
    }

    #[tokio::test]
    async fn create_session_twice_errors() {
        let app = linear_app();
        let mut runner = AppRunner::with_checkpointer_and_bus(
            app,
            Arc::new(InMemoryCheckpointer::new()),
            Arc::new(EventBus::default()),
        );
        runner.create_session("s1".into(), State::new()).await.unwrap();
        let err = runner.create_session("s1".into(), State::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::SessionAlreadyExists { .. }));
    }
}
