//! Server-side barrier rendezvous for tasks of one group.
//!
//! A barrier is keyed by (workflow, group, name). Each task name counts once.
//! When the expected number of distinct tasks has arrived every parked waiter
//! is released and the key is reset, so the same name can be reused for the
//! next phase.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BarrierKey {
    pub workflow_id: String,
    pub group_name: String,
    pub name: String,
}

impl BarrierKey {
    pub fn new(
        workflow_id: impl Into<String>,
        group_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            group_name: group_name.into(),
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BarrierError {
    #[error("barrier expects a positive participant count")]
    ZeroCount,
    #[error("barrier already waiting for {existing} participants, request asked for {requested}")]
    CountMismatch { existing: u32, requested: u32 },
    #[error("barrier timed out after {0:?}")]
    Timeout(Duration),
    #[error("barrier wait was superseded by a newer arrival from the same task")]
    Superseded,
}

type Waiter = oneshot::Sender<Result<(), BarrierError>>;

struct BarrierState {
    expected: u32,
    generation: u64,
    // task name -> parked waiter
    waiters: HashMap<String, Waiter>,
}

#[derive(Default)]
struct Barriers {
    next_generation: u64,
    states: HashMap<BarrierKey, BarrierState>,
}

pub struct BarrierRegistry {
    timeout: Duration,
    inner: Mutex<Barriers>,
}

impl BarrierRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inner: Mutex::new(Barriers::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of barriers with at least one parked participant.
    pub fn pending(&self) -> usize {
        self.inner.lock().expect("barrier registry poisoned").states.len()
    }

    /// Arrive at `key` as `task_name` and wait until `expected` distinct tasks
    /// have arrived, or the registry timeout elapses.
    pub async fn wait(
        &self,
        key: BarrierKey,
        task_name: &str,
        expected: u32,
    ) -> Result<(), BarrierError> {
        if expected == 0 {
            return Err(BarrierError::ZeroCount);
        }

        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut inner = self.inner.lock().expect("barrier registry poisoned");
            let Barriers {
                next_generation,
                states,
            } = &mut *inner;
            let state = states.entry(key.clone()).or_insert_with(|| {
                let generation = *next_generation;
                *next_generation += 1;
                BarrierState {
                    expected,
                    generation,
                    waiters: HashMap::new(),
                }
            });

            if state.expected != expected {
                return Err(BarrierError::CountMismatch {
                    existing: state.expected,
                    requested: expected,
                });
            }

            if let Some(previous) = state.waiters.insert(task_name.to_string(), tx) {
                let _ = previous.send(Err(BarrierError::Superseded));
            }
            let generation = state.generation;
            let arrived = state.waiters.len() as u32;
            debug!(
                workflow_id = %key.workflow_id,
                group = %key.group_name,
                barrier = %key.name,
                task = %task_name,
                arrived,
                expected,
                "barrier arrival"
            );

            if arrived >= expected {
                if let Some(state) = states.remove(&key) {
                    info!(
                        workflow_id = %key.workflow_id,
                        group = %key.group_name,
                        barrier = %key.name,
                        released = state.waiters.len(),
                        "barrier released"
                    );
                    for (_, waiter) in state.waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            generation
        };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BarrierError::Superseded),
            Err(_) => {
                self.expire(&key, generation);
                Err(BarrierError::Timeout(self.timeout))
            }
        }
    }

    // Fail every waiter of this generation; a released or newer barrier under
    // the same key is left alone.
    fn expire(&self, key: &BarrierKey, generation: u64) {
        let mut inner = self.inner.lock().expect("barrier registry poisoned");
        let matches = inner
            .states
            .get(key)
            .is_some_and(|state| state.generation == generation);
        if !matches {
            return;
        }
        if let Some(state) = inner.states.remove(key) {
            warn!(
                workflow_id = %key.workflow_id,
                group = %key.group_name,
                barrier = %key.name,
                arrived = state.waiters.len(),
                expected = state.expected,
                "barrier timed out"
            );
            for (_, waiter) in state.waiters {
                let _ = waiter.send(Err(BarrierError::Timeout(self.timeout)));
            }
        }
    }
}
