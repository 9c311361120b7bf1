//! Checkpointer trait, the `Checkpoint` record, and the resilient wrapper (§4.D).
//!
//! A checkpoint is written once per super-step and never modified. The
//! ordered chain `id ← parent_id` forms a tree per `thread_id`; the head is
//! the unique tip with no descendant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::channels::State;
use crate::types::NodeKind;

/// A single node's write, logged between super-steps for audit/debugging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Write {
    pub task_id: String,
    pub channel: String,
    pub value: Value,
}

/// An immutable snapshot of fully-reduced state after one super-step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub parent_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub channel_values: State,
    pub pending_writes: Vec<Write>,
    pub next_nodes: Vec<NodeKind>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(id: String, parent_id: Option<String>, channel_values: State, next_nodes: Vec<NodeKind>) -> Self {
        Self {
            id,
            parent_id,
            ts: Utc::now(),
            channel_values,
            pending_writes: Vec::new(),
            next_nodes,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointerError {
    #[error("no checkpoint found for thread {thread_id}")]
    #[diagnostic(code(stepgraph::checkpointer::not_found))]
    NotFound { thread_id: String },

    #[error("checkpointer backend error: {message}")]
    #[diagnostic(
        code(stepgraph::checkpointer::backend),
        help("Check backend connectivity, credentials, and that migrations have run.")
    )]
    Backend { message: String },

    #[error("checkpointer error: {message}")]
    #[diagnostic(code(stepgraph::checkpointer::other))]
    Other { message: String },
}

pub type Result<T> = std::result::Result<T, CheckpointerError>;

/// Pluggable durable store of checkpoints, keyed by `thread_id` (§4.D).
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// The checkpoint with the greatest `ts` for `thread_id`, if any.
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints for `thread_id`, newest first.
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Persist `checkpoint` as the new head of `thread_id`. Atomic per call.
    async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<String>;

    /// Log node writes between super-steps, for audit/debugging; never
    /// required for resumption (resumption reads `channel_values` alone).
    async fn put_writes(&self, thread_id: &str, checkpoint_id: &str, writes: Vec<Write>) -> Result<()>;
}

/// Selects which durable backend a [`crate::runtimes::runtime_config::RuntimeConfig`]
/// should construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointerType {
    /// SQLite-backed embedded KV store at a file path (§4.D embedded KV).
    #[cfg(feature = "sqlite")]
    Embedded { path: String },
    /// Postgres-backed SQL relational store (§4.D SQL relational).
    #[cfg(feature = "postgres")]
    Sql { url: String },
    /// SQL relational backend wrapped with bounded retries and an embedded
    /// KV fallback (§4.D resilient wrapper) — the canonical choice (§9).
    #[cfg(all(feature = "sqlite", feature = "postgres"))]
    Resilient { sql_url: String, fallback_path: String },
}

/// Wraps a primary [`Checkpointer`] with bounded retries (default 3, delays
/// 1/2/4s); on exhaustion, every subsequent call for the process lifetime
/// transparently falls back to a secondary (embedded KV) backend and logs a
/// `degraded` warning once. Degraded mode is process-local, not shared
/// across processes writing to the same `thread_id` — a documented
/// compromise preserving availability over strict consistency (§4.D).
pub struct ResilientCheckpointer {
    primary: Arc<dyn Checkpointer>,
    fallback: Arc<dyn Checkpointer>,
    max_retries: u32,
    degraded: std::sync::atomic::AtomicBool,
}

impl ResilientCheckpointer {
    #[must_use]
    pub fn new(primary: Arc<dyn Checkpointer>, fallback: Arc<dyn Checkpointer>) -> Self {
        Self {
            primary,
            fallback,
            max_retries: 3,
            degraded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn backend(&self) -> &Arc<dyn Checkpointer> {
        if self.degraded.load(std::sync::atomic::Ordering::Relaxed) {
            &self.fallback
        } else {
            &self.primary
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Checkpointer>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if self.degraded.load(std::sync::atomic::Ordering::Relaxed) {
            return op(self.fallback.clone()).await;
        }

        let mut last_err = None;
        for attempt in 0..self.max_retries {
            match op(self.primary.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "checkpointer primary backend failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }

        self.degraded.store(true, std::sync::atomic::Ordering::Relaxed);
        tracing::warn!(
            error = ?last_err,
            "checkpointer primary backend exhausted retries; falling back to embedded KV (degraded mode)"
        );
        op(self.fallback.clone()).await
    }
}

#[async_trait]
impl Checkpointer for ResilientCheckpointer {
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let thread_id = thread_id.to_string();
        self.with_retry(move |backend| {
            let thread_id = thread_id.clone();
            async move { backend.get_latest(&thread_id).await }
        })
        .await
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let thread_id = thread_id.to_string();
        self.with_retry(move |backend| {
            let thread_id = thread_id.clone();
            async move { backend.list(&thread_id).await }
        })
        .await
    }

    async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<String> {
        let thread_id = thread_id.to_string();
        self.with_retry(move |backend| {
            let thread_id = thread_id.clone();
            let checkpoint = checkpoint.clone();
            async move { backend.put(&thread_id, checkpoint).await }
        })
        .await
    }

    async fn put_writes(&self, thread_id: &str, checkpoint_id: &str, writes: Vec<Write>) -> Result<()> {
        let thread_id = thread_id.to_string();
        let checkpoint_id = checkpoint_id.to_string();
        self.with_retry(move |backend| {
            let thread_id = thread_id.clone();
            let checkpoint_id = checkpoint_id.clone();
            let writes = writes.clone();
            async move { backend.put_writes(&thread_id, &checkpoint_id, writes).await }
        })
        .await
    }
}

/// Process-local, in-memory backend. Used when no persistent checkpointer is
/// configured: short-lived embeddings, and as the fallback when the
/// `sqlite`/`postgres` features are both disabled. Nothing survives process
/// exit.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    by_thread: std::sync::Mutex<std::collections::HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .by_thread
            .lock()
            .unwrap()
            .get(thread_id)
            .and_then(|v| v.last().cloned()))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let mut v = self
            .by_thread
            .lock()
            .unwrap()
            .get(thread_id)
            .cloned()
            .unwrap_or_default();
        v.reverse();
        Ok(v)
    }

    async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<String> {
        let id = checkpoint.id.clone();
        self.by_thread
            .lock()
            .unwrap()
            .entry(thread_id.to_string())
            .or_default()
            .push(checkpoint);
        Ok(id)
    }

    async fn put_writes(&self, _thread_id: &str, _checkpoint_id: &str, _writes: Vec<Write>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemCheckpointer {
        by_thread: Mutex<std::collections::HashMap<String, Vec<Checkpoint>>>,
    }

    #[async_trait]
    impl Checkpointer for MemCheckpointer {
        async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
            Ok(self
                .by_thread
                .lock()
                .unwrap()
                .get(thread_id)
                .and_then(|v| v.last().cloned()))
        }

        async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
            let mut v = self
                .by_thread
                .lock()
                .unwrap()
                .get(thread_id)
                .cloned()
                .unwrap_or_default();
            v.reverse();
            Ok(v)
        }

        async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<String> {
            let id = checkpoint.id.clone();
            self.by_thread
                .lock()
                .unwrap()
                .entry(thread_id.to_string())
                .or_default()
                .push(checkpoint);
            Ok(id)
        }

        async fn put_writes(&self, _thread_id: &str, _checkpoint_id: &str, _writes: Vec<Write>) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Checkpointer for AlwaysFails {
        async fn get_latest(&self, _thread_id: &str) -> Result<Option<Checkpoint>> {
            Err(CheckpointerError::Backend { message: "down".into() })
        }
        async fn list(&self, _thread_id: &str) -> Result<Vec<Checkpoint>> {
            Err(CheckpointerError::Backend { message: "down".into() })
        }
        async fn put(&self, _thread_id: &str, _checkpoint: Checkpoint) -> Result<String> {
            Err(CheckpointerError::Backend { message: "down".into() })
        }
        async fn put_writes(&self, _thread_id: &str, _checkpoint_id: &str, _writes: Vec<Write>) -> Result<()> {
            Err(CheckpointerError::Backend { message: "down".into() })
        }
    }

    #[tokio::test]
    async fn falls_back_to_secondary_after_exhausting_retries() {
        let resilient = ResilientCheckpointer::new(Arc::new(AlwaysFails), Arc::new(MemCheckpointer::default()));
        let checkpoint = Checkpoint::new("c1".into(), None, State::new(), vec![]);
        let id = resilient.put("thread-1", checkpoint).await.unwrap();
        assert_eq!(id, "c1");
        assert!(resilient.degraded.load(std::sync::atomic::Ordering::Relaxed));

        // Subsequent calls go straight to the fallback without retrying the primary.
        let latest = resilient.get_latest("thread-1").await.unwrap();
        assert!(latest.is_some());
    }

    #[tokio::test]
    async fn primary_success_never_touches_fallback() {
        let resilient = ResilientCheckpointer::new(Arc::new(MemCheckpointer::default()), Arc::new(AlwaysFails));
        let checkpoint = Checkpoint::new("c1".into(), None, State::new(), vec![]);
        resilient.put("thread-1", checkpoint).await.unwrap();
        assert!(!resilient.degraded.load(std::sync::atomic::Ordering::Relaxed));
    }
}
