//! Postgres backend for the event log, node condition queues and task logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tonic::async_trait;

use super::base::{
    BackendResult, EventLogBackend, EventRecord, NewEvent, NodeConditionBackend, TaskLogBackend,
    TaskLogLine,
};
use crate::messages::{NodeConditionRules, node_condition_queue_key};

/// How often a blocking pop re-checks an empty queue.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Durable store in Postgres.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    query_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn connect(dsn: &str) -> BackendResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn query_counts(&self) -> HashMap<String, usize> {
        self.query_counts
            .lock()
            .expect("query counts poisoned")
            .clone()
    }

    fn count_query(&self, label: &str) {
        let mut guard = self.query_counts.lock().expect("query counts poisoned");
        *guard.entry(label.to_string()).or_insert(0) += 1;
    }

    async fn try_pop(&self, queue_key: &str) -> BackendResult<Option<String>> {
        self.count_query("delete:node_condition_queue_pop");
        let row = sqlx::query(
            r#"
            DELETE FROM node_condition_queue
            WHERE id = (
                SELECT id FROM node_condition_queue
                WHERE queue_key = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload
            "#,
        )
        .bind(queue_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.get("payload")))
    }
}

#[async_trait]
impl EventLogBackend for PostgresBackend {
    async fn append_event(&self, event: NewEvent) -> BackendResult<i64> {
        self.count_query("insert:event_log");
        let row = sqlx::query(
            r#"
            INSERT INTO event_log (stream_key, backend_name, message_uuid, message_timestamp, body)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING event_offset
            "#,
        )
        .bind(&event.stream_key)
        .bind(&event.backend_name)
        .bind(&event.message_uuid)
        .bind(event.message_timestamp)
        .bind(&event.body)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("event_offset"))
    }

    async fn read_events(
        &self,
        stream_key: &str,
        after: i64,
        limit: usize,
    ) -> BackendResult<Vec<EventRecord>> {
        self.count_query("select:event_log");
        let rows = sqlx::query(
            r#"
            SELECT event_offset, stream_key, backend_name, message_uuid,
                   message_timestamp, body, received_at
            FROM event_log
            WHERE stream_key = $1 AND event_offset > $2
            ORDER BY event_offset
            LIMIT $3
            "#,
        )
        .bind(stream_key)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| EventRecord {
                offset: row.get("event_offset"),
                stream_key: row.get("stream_key"),
                backend_name: row.get("backend_name"),
                message_uuid: row.get("message_uuid"),
                message_timestamp: row.get("message_timestamp"),
                body: row.get("body"),
                received_at: row.get("received_at"),
            })
            .collect())
    }
}

#[async_trait]
impl NodeConditionBackend for PostgresBackend {
    async fn get_node_conditions(&self, backend_name: &str) -> BackendResult<NodeConditionRules> {
        self.count_query("select:node_condition_rules");
        let row = sqlx::query("SELECT rules FROM node_condition_rules WHERE backend_name = $1")
            .bind(backend_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.get::<Json<NodeConditionRules>, _>("rules").0)
            .unwrap_or_default())
    }

    async fn push_node_conditions(
        &self,
        backend_name: &str,
        rules: &NodeConditionRules,
    ) -> BackendResult<()> {
        let payload = serde_json::to_string(rules)?;
        let mut tx = self.pool.begin().await?;
        self.count_query("upsert:node_condition_rules");
        sqlx::query(
            r#"
            INSERT INTO node_condition_rules (backend_name, rules, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (backend_name)
            DO UPDATE SET rules = EXCLUDED.rules, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(backend_name)
        .bind(Json(rules))
        .execute(&mut *tx)
        .await?;
        self.count_query("insert:node_condition_queue");
        sqlx::query("INSERT INTO node_condition_queue (queue_key, payload) VALUES ($1, $2)")
            .bind(node_condition_queue_key(backend_name))
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn enqueue_node_condition_payload(
        &self,
        backend_name: &str,
        payload: &str,
    ) -> BackendResult<()> {
        self.count_query("insert:node_condition_queue");
        sqlx::query("INSERT INTO node_condition_queue (queue_key, payload) VALUES ($1, $2)")
            .bind(node_condition_queue_key(backend_name))
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_node_condition_update(
        &self,
        backend_name: &str,
        timeout: Duration,
    ) -> BackendResult<Option<String>> {
        let key = node_condition_queue_key(backend_name);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_pop(&key).await? {
                return Ok(Some(payload));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(QUEUE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl TaskLogBackend for PostgresBackend {
    async fn append_task_logs(&self, log_key: &str, lines: &[TaskLogLine]) -> BackendResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO task_logs (log_key, source, io_type, logged_at, text) ");
        builder.push_values(lines.iter(), |mut row, line| {
            row.push_bind(log_key)
                .push_bind(&line.source)
                .push_bind(&line.io_type)
                .push_bind(line.time)
                .push_bind(&line.text);
        });
        self.count_query("insert:task_logs");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn close_task_log(&self, log_key: &str) -> BackendResult<()> {
        self.count_query("upsert:task_log_records");
        sqlx::query(
            r#"
            INSERT INTO task_log_records (log_key, closed_at)
            VALUES ($1, NOW())
            ON CONFLICT (log_key) DO UPDATE SET closed_at = EXCLUDED.closed_at
            "#,
        )
        .bind(log_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_task_logs(&self, log_key: &str) -> BackendResult<Vec<TaskLogLine>> {
        self.count_query("select:task_logs");
        let rows = sqlx::query(
            "SELECT source, io_type, logged_at, text FROM task_logs WHERE log_key = $1 ORDER BY id",
        )
        .bind(log_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TaskLogLine {
                source: row.get("source"),
                io_type: row.get("io_type"),
                time: row.get::<DateTime<Utc>, _>("logged_at"),
                text: row.get("text"),
            })
            .collect())
    }

    async fn task_log_closed(&self, log_key: &str) -> BackendResult<bool> {
        self.count_query("select:task_log_records");
        let row = sqlx::query("SELECT closed_at FROM task_log_records WHERE log_key = $1")
            .bind(log_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|row| row.get::<Option<DateTime<Utc>>, _>("closed_at"))
            .is_some())
    }
}
