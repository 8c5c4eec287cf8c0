//! Background consumer that feeds the durable event log into trackers.
//!
//! Each consumer keeps its own cursor, so several readers can follow the same
//! log independently. Replayed messages carry their original uuid and are
//! dropped by the tracker's duplicate check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status::WorkflowStatus;
use super::tracker::{ApplyOutcome, WorkflowTracker};
use crate::backends::{BackendResult, EventLogBackend, EventRecord};
use crate::messages::{BackendEvent, OPERATOR_MESSAGES_KEY};
use crate::retry::{
    Backoff, BackoffConfig, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS,
};

/// Shared set of live workflow trackers keyed by workflow id.
#[derive(Clone, Default)]
pub struct TrackerRegistry {
    inner: Arc<Mutex<HashMap<String, WorkflowTracker>>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tracker: WorkflowTracker) {
        let id = tracker.workflow().id.clone();
        self.inner
            .lock()
            .expect("tracker registry poisoned")
            .insert(id, tracker);
    }

    pub fn remove(&self, workflow_id: &str) -> Option<WorkflowTracker> {
        self.inner
            .lock()
            .expect("tracker registry poisoned")
            .remove(workflow_id)
    }

    /// Run `f` against one tracker while holding the registry lock.
    pub fn with<R>(
        &self,
        workflow_id: &str,
        f: impl FnOnce(&mut WorkflowTracker) -> R,
    ) -> Option<R> {
        self.inner
            .lock()
            .expect("tracker registry poisoned")
            .get_mut(workflow_id)
            .map(f)
    }

    pub fn status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.with(workflow_id, |tracker| tracker.status())
    }
}

#[derive(Debug, Clone)]
pub struct EventConsumerConfig {
    pub stream_key: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Delay between attempts after the event log read fails.
    pub backoff: BackoffConfig,
    pub max_backoff: Duration,
}

impl Default for EventConsumerConfig {
    fn default() -> Self {
        Self {
            stream_key: OPERATOR_MESSAGES_KEY.to_string(),
            poll_interval: Duration::from_millis(200),
            batch_size: 256,
            backoff: BackoffConfig::exponential(DEFAULT_BASE_DELAY_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_DELAY_MS as u64),
        }
    }
}

pub struct EventConsumer<B> {
    backend: B,
    trackers: TrackerRegistry,
    config: EventConsumerConfig,
    cursor: i64,
}

impl<B> EventConsumer<B>
where
    B: EventLogBackend + Clone + Send + Sync + 'static,
{
    pub fn new(backend: B, trackers: TrackerRegistry, config: EventConsumerConfig) -> Self {
        Self {
            backend,
            trackers,
            config,
            cursor: 0,
        }
    }

    /// Resume after an offset that was already consumed.
    pub fn with_cursor(mut self, cursor: i64) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Read and apply one batch. Returns how many records were read.
    pub async fn poll_once(&mut self) -> BackendResult<usize> {
        let records = self
            .backend
            .read_events(&self.config.stream_key, self.cursor, self.config.batch_size)
            .await?;
        for record in &records {
            self.handle(record);
            self.cursor = self.cursor.max(record.offset);
        }
        Ok(records.len())
    }

    fn handle(&self, record: &EventRecord) {
        let event = match BackendEvent::from_body(&record.body) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    offset = record.offset,
                    uuid = %record.message_uuid,
                    backend = %record.backend_name,
                    error = %err,
                    "skipping undecodable event"
                );
                return;
            }
        };

        match event {
            BackendEvent::Heartbeat { backend } => {
                debug!(%backend, offset = record.offset, "backend heartbeat");
            }
            BackendEvent::TaskUpdate(update) => {
                let applied = self.trackers.with(&update.workflow_id, |tracker| {
                    tracker.apply(&record.message_uuid, &update)
                });
                match applied {
                    None => debug!(
                        workflow_id = %update.workflow_id,
                        "no tracker for workflow; skipping update"
                    ),
                    Some(Ok(ApplyOutcome::Applied)) => debug!(
                        workflow_id = %update.workflow_id,
                        task = %update.task_name,
                        status = %update.status,
                        "applied task update"
                    ),
                    Some(Ok(outcome)) => debug!(
                        workflow_id = %update.workflow_id,
                        task = %update.task_name,
                        ?outcome,
                        "task update not applied"
                    ),
                    Some(Err(err)) => warn!(
                        workflow_id = %update.workflow_id,
                        error = %err,
                        "rejected task update"
                    ),
                }
            }
        }
    }

    /// Poll until `shutdown` fires. Store errors back off and retry.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            stream_key = %self.config.stream_key,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "event consumer started"
        );
        let mut backoff = Backoff::new(self.config.backoff, self.config.max_backoff);
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(cursor = self.cursor, "event consumer shutting down");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    match self.poll_once().await {
                        Ok(read) => {
                            backoff.reset();
                            delay = if read >= self.config.batch_size {
                                Duration::ZERO
                            } else {
                                self.config.poll_interval
                            };
                        }
                        Err(err) => {
                            delay = backoff.next_delay();
                            error!(
                                error = %err,
                                attempt = backoff.attempt(),
                                delay_ms = delay.as_millis(),
                                "event log read failed"
                            );
                        }
                    }
                }
            }
        }
    }
}
