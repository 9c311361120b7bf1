//! Embedded KV checkpointer backend: single-process, file-backed SQLite (§4.D).
//!
//! Schema initialises on first open: `checkpoints(thread_id, id, parent_id,
//! ts, payload)` and `writes(thread_id, checkpoint_id, task_id, channel,
//! value)`, matching §6's logical checkpoint storage schema. Journaling is
//! set to WAL for crash-resilience under a single writer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::checkpointer::{Checkpoint, Checkpointer, CheckpointerError, Result, Write};
use crate::types::NodeKind;

pub struct EmbeddedCheckpointer {
    pool: SqlitePool,
}

impl EmbeddedCheckpointer {
    /// Open (creating if absent) the SQLite database at `path` and run the
    /// embedded schema setup.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
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
                ts TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (thread_id, id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS writes (
                thread_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        Ok(())
    }
}

fn row_to_checkpoint(thread_id: &str, row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
    let id: String = row.try_get("id").map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;
    let parent_id: Option<String> = row.try_get("parent_id").map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;
    let ts: String = row.try_get("ts").map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;
    let payload: String = row.try_get("payload").map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

    let ts: DateTime<Utc> = ts
        .parse()
        .map_err(|e: chrono::ParseError| CheckpointerError::Other { message: e.to_string() })?;

    #[derive(serde::Deserialize)]
    struct Payload {
        channel_values: crate::channels::State,
        next_nodes: Vec<NodeKind>,
    }
    let payload: Payload = serde_json::from_str(&payload).map_err(|e| CheckpointerError::Other { message: e.to_string() })?;

    let _ = thread_id;
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
impl Checkpointer for EmbeddedCheckpointer {
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT id, parent_id, ts, payload FROM checkpoints WHERE thread_id = ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        row.map(|r| row_to_checkpoint(thread_id, &r)).transpose()
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT id, parent_id, ts, payload FROM checkpoints WHERE thread_id = ? ORDER BY ts DESC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend { message: e.to_string() })?;

        rows.iter().map(|r| row_to_checkpoint(thread_id, r)).collect()
    }

    async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<String> {
        #[derive(serde::Serialize)]
        struct Payload<'a> {
            channel_values: &'a crate::channels::State,
            next_nodes: &'a [NodeKind],
        }
        let payload = serde_json::to_string(&Payload {
            channel_values: &checkpoint.channel_values,
            next_nodes: &checkpoint.next_nodes,
        })
        .map_err(|e| CheckpointerError::Other { message: e.to_string() })?;

        sqlx::query(
            "INSERT INTO checkpoints (thread_id, id, parent_id, ts, payload) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(&checkpoint.id)
        .bind(&checkpoint.parent_id)
        .bind(checkpoint.ts.to_rfc3339())
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
            let value = serde_json::to_string(&write.value).map_err(|e| CheckpointerError::Other { message: e.to_string() })?;
            sqlx::query(
                "INSERT INTO writes (thread_id, checkpoint_id, task_id, channel, value) VALUES (?, ?, ?, ?, ?)",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::State;

    #[tokio::test]
    async fn put_then_get_latest_roundtrips() {
        let backend = EmbeddedCheckpointer::open(":memory:").await.unwrap();
        let mut state = State::new();
        state.set("output", "hello");
        let checkpoint = Checkpoint::new("c1".into(), None, state, vec![NodeKind::End]);
        backend.put("thread-1", checkpoint).await.unwrap();

        let latest = backend.get_latest("thread-1").await.unwrap().unwrap();
        assert_eq!(latest.id, "c1");
        assert_eq!(latest.channel_values.get("output").unwrap(), "hello");
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let backend = EmbeddedCheckpointer::open(":memory:").await.unwrap();
        let c1 = Checkpoint::new("c1".into(), None, State::new(), vec![]);
        backend.put("thread-1", c1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let c2 = Checkpoint::new("c2".into(), Some("c1".into()), State::new(), vec![]);
        backend.put("thread-1", c2).await.unwrap();

        let list = backend.list("thread-1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "c2");
    }
}
