//! SQL relational checkpointer backend: multi-process, Postgres-backed (§4.D).
//!
//! Same logical schema as the embedded backend, with a `thread_id` index.
//! `put` is a single insert; `writes` carries no foreign key to
//! `checkpoints` — readers tolerate orphan rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::checkpointer::{Checkpoint, Checkpointer, CheckpointerError, Result, Write};
use crate::types::NodeKind;

pub struct SqlCheckpointer {
    pool: PgPool,
}

impl SqlCheckpointer {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                id TEXT NOT NULL,
                parent_id TEXT,
                ts TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (thread_id, id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        sqlx::query("CREATE INDEX IF NOT EXISTS checkpoints_thread_id_idx ON checkpoints (thread_id, ts DESC)")
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS writes (
                thread_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                value JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Payload {
    channel_values: crate::channels::State,
    next_nodes: Vec<NodeKind>,
}

fn row_to_checkpoint(row: &sqlx::postgres::PgRow) -> Result<Checkpoint> {
    let id: String = row.try_get("id").map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;
    let parent_id: Option<String> = row.try_get("parent_id").map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;
    let ts: DateTime<Utc> = row.try_get("ts").map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;
    let payload: serde_json::Value = row.try_get("payload").map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;
    let payload: Payload = serde_json::from_value(payload).map_err(|e| CheckpointerError::Other { message: e.to_string() })?;

    Ok(Checkpoint {
        id,
        parent_id,
        ts,
        channel_values: payload.channel_values,
        pending_writes: Vec::new(),
        next_nodes: payload.next_nodes,
    })
}

#[async_trait]
impl Checkpointer for SqlCheckpointer {
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT id, parent_id, ts, payload FROM checkpoints WHERE thread_id = $1 ORDER BY ts DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        row.as_ref().map(row_to_checkpoint).transpose()
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT id, parent_id, ts, payload FROM checkpoints WHERE thread_id = $1 ORDER BY ts DESC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<String> {
        let payload = serde_json::to_value(Payload {
            channel_values: checkpoint.channel_values.clone(),
            next_nodes: checkpoint.next_nodes.clone(),
        })
        .map_err(|e| CheckpointerError::Other { message: e.to_string() })?;

        sqlx::query(
            "INSERT INTO checkpoints (thread_id, id, parent_id, ts, payload) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(thread_id)
        .bind(&checkpoint.id)
        .bind(&checkpoint.parent_id)
        .bind(checkpoint.ts)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        if !checkpoint.pending_writes.is_empty() {
            self.put_writes(thread_id, &checkpoint.id, checkpoint.pending_writes).await?;
        }

        Ok(checkpoint.id)
    }

    async fn put_writes(&self, thread_id: &str, checkpoint_id: &str, writes: Vec<Write>) -> Result<()> {
        for write in writes {
            let value = serde_json::to_value(&write.value).map_err(|e| CheckpointerError::Other { message: e.to_string() })?;
            sqlx::query(
                "INSERT INTO writes (thread_id, checkpoint_id, task_id, channel, value) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(thread_id)
            .bind(checkpoint_id)
            .bind(&write.task_id)
            .bind(&write.channel)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;
        }
        Ok(())
    }
}
