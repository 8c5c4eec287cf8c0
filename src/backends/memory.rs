//! In-memory backend for tests or local runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tonic::async_trait;

use super::base::{
    BackendError, BackendResult, EventLogBackend, EventRecord, NewEvent, NodeConditionBackend,
    TaskLogBackend, TaskLogLine,
};
use crate::messages::{NodeConditionRules, node_condition_queue_key};

/// Backend that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    events: Arc<Mutex<Vec<EventRecord>>>,
    rules: Arc<Mutex<HashMap<String, NodeConditionRules>>>,
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    queue_signals: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    task_logs: Arc<Mutex<HashMap<String, Vec<TaskLogLine>>>>,
    closed_logs: Arc<Mutex<HashSet<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every appended event, in offset order.
    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().expect("events poisoned").clone()
    }

    pub fn queued_node_condition_updates(&self, backend_name: &str) -> usize {
        self.queues
            .lock()
            .expect("queues poisoned")
            .get(&node_condition_queue_key(backend_name))
            .map_or(0, VecDeque::len)
    }

    fn queue_signal(&self, queue_key: &str) -> Arc<Notify> {
        self.queue_signals
            .lock()
            .expect("queue signals poisoned")
            .entry(queue_key.to_string())
            .or_default()
            .clone()
    }

    fn enqueue(&self, backend_name: &str, payload: String) {
        let key = node_condition_queue_key(backend_name);
        self.queues
            .lock()
            .expect("queues poisoned")
            .entry(key.clone())
            .or_default()
            .push_back(payload);
        self.queue_signal(&key).notify_waiters();
    }

    fn try_pop(&self, queue_key: &str) -> Option<String> {
        self.queues
            .lock()
            .expect("queues poisoned")
            .get_mut(queue_key)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl EventLogBackend for MemoryBackend {
    async fn append_event(&self, event: NewEvent) -> BackendResult<i64> {
        let mut events = self.events.lock().expect("events poisoned");
        let offset = events.len() as i64 + 1;
        events.push(EventRecord {
            offset,
            stream_key: event.stream_key,
            backend_name: event.backend_name,
            message_uuid: event.message_uuid,
            message_timestamp: event.message_timestamp,
            body: event.body,
            received_at: Utc::now(),
        });
        Ok(offset)
    }

    async fn read_events(
        &self,
        stream_key: &str,
        after: i64,
        limit: usize,
    ) -> BackendResult<Vec<EventRecord>> {
        let events = self.events.lock().expect("events poisoned");
        Ok(events
            .iter()
            .filter(|event| event.offset > after && event.stream_key == stream_key)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NodeConditionBackend for MemoryBackend {
    async fn get_node_conditions(&self, backend_name: &str) -> BackendResult<NodeConditionRules> {
        Ok(self
            .rules
            .lock()
            .expect("rules poisoned")
            .get(backend_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn push_node_conditions(
        &self,
        backend_name: &str,
        rules: &NodeConditionRules,
    ) -> BackendResult<()> {
        let payload = rules
            .to_json()
            .map_err(|err| BackendError::Message(format!("encode node conditions: {err}")))?;
        self.rules
            .lock()
            .expect("rules poisoned")
            .insert(backend_name.to_string(), rules.clone());
        self.enqueue(backend_name, payload);
        Ok(())
    }

    async fn enqueue_node_condition_payload(
        &self,
        backend_name: &str,
        payload: &str,
    ) -> BackendResult<()> {
        self.enqueue(backend_name, payload.to_string());
        Ok(())
    }

    async fn pop_node_condition_update(
        &self,
        backend_name: &str,
        timeout: Duration,
    ) -> BackendResult<Option<String>> {
        let key = node_condition_queue_key(backend_name);
        let signal = self.queue_signal(&key);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so a push between the check and the
            // wait is not missed.
            let notified = signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop(&key) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl TaskLogBackend for MemoryBackend {
    async fn append_task_logs(&self, log_key: &str, lines: &[TaskLogLine]) -> BackendResult<()> {
        self.task_logs
            .lock()
            .expect("task logs poisoned")
            .entry(log_key.to_string())
            .or_default()
            .extend(lines.iter().cloned());
        Ok(())
    }

    async fn close_task_log(&self, log_key: &str) -> BackendResult<()> {
        self.closed_logs
            .lock()
            .expect("closed logs poisoned")
            .insert(log_key.to_string());
        Ok(())
    }

    async fn read_task_logs(&self, log_key: &str) -> BackendResult<Vec<TaskLogLine>> {
        Ok(self
            .task_logs
            .lock()
            .expect("task logs poisoned")
            .get(log_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn task_log_closed(&self, log_key: &str) -> BackendResult<bool> {
        Ok(self
            .closed_logs
            .lock()
            .expect("closed logs poisoned")
            .contains(log_key))
    }
}
