//! Durable store interfaces shared by the coordination services.
//!
//! The store is the single source of truth across stream loops: access is
//! append-only (event log, task logs) or pop-destructive (node condition
//! queues), never read-modify-write.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tonic::async_trait;

use crate::messages::NodeConditionRules;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A data message about to be appended to the event log.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub stream_key: String,
    pub backend_name: String,
    pub message_uuid: String,
    pub message_timestamp: DateTime<Utc>,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// Persisted event log entry. `offset` increases monotonically per store.
pub struct EventRecord {
    pub offset: i64,
    pub stream_key: String,
    pub backend_name: String,
    pub message_uuid: String,
    pub message_timestamp: DateTime<Utc>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// One persisted controller log line.
pub struct TaskLogLine {
    pub source: String,
    /// `IoType` label, e.g. `STDOUT`.
    pub io_type: String,
    pub time: DateTime<Utc>,
    pub text: String,
}

/// Multi-reader append log for relayed backend events.
#[async_trait]
pub trait EventLogBackend: Send + Sync {
    /// Append and return the entry's offset. Must be durable on `Ok`.
    async fn append_event(&self, event: NewEvent) -> BackendResult<i64>;

    /// Entries of `stream_key` with offset greater than `after`, oldest first.
    async fn read_events(
        &self,
        stream_key: &str,
        after: i64,
        limit: usize,
    ) -> BackendResult<Vec<EventRecord>>;
}

/// Per-backend node condition rules and their push queue.
#[async_trait]
pub trait NodeConditionBackend: Send + Sync {
    /// Current rule set for a backend; empty when none was pushed.
    async fn get_node_conditions(&self, backend_name: &str) -> BackendResult<NodeConditionRules>;

    /// Replace the rule set and enqueue it for open streams.
    async fn push_node_conditions(
        &self,
        backend_name: &str,
        rules: &NodeConditionRules,
    ) -> BackendResult<()>;

    /// Enqueue a raw payload without touching the stored rule set.
    async fn enqueue_node_condition_payload(
        &self,
        backend_name: &str,
        payload: &str,
    ) -> BackendResult<()>;

    /// Pop the oldest queued payload, waiting up to `timeout`.
    async fn pop_node_condition_update(
        &self,
        backend_name: &str,
        timeout: Duration,
    ) -> BackendResult<Option<String>>;
}

/// Task log records written by controller sessions.
#[async_trait]
pub trait TaskLogBackend: Send + Sync {
    async fn append_task_logs(&self, log_key: &str, lines: &[TaskLogLine]) -> BackendResult<()>;

    /// Mark the record complete after `LOG_DONE`.
    async fn close_task_log(&self, log_key: &str) -> BackendResult<()>;

    async fn read_task_logs(&self, log_key: &str) -> BackendResult<Vec<TaskLogLine>>;

    async fn task_log_closed(&self, log_key: &str) -> BackendResult<bool>;
}

/// Everything the coordination server needs from its store.
pub trait CoordinationBackend:
    EventLogBackend + NodeConditionBackend + TaskLogBackend + Clone + 'static
{
}

impl<T> CoordinationBackend for T where
    T: EventLogBackend + NodeConditionBackend + TaskLogBackend + Clone + 'static
{
}
