//! OSMO - workflow execution engine.
//!
//! - [`lifecycle`]: status state machine, rollups, recovery and the event
//!   consumer that drives per-workflow trackers.
//! - [`server`] / [`backends`]: the coordination service that compute
//!   backends and in-pod controllers connect to, over a durable store.
//! - [`operator`]: backend-side clients of the coordination service.
//! - [`controller`]: the in-pod task controller.

pub mod backends;
pub mod config;
pub mod controller;
pub mod lifecycle;
pub mod messages;
pub mod observability;
pub mod operator;
pub mod retry;
pub mod server;

pub use backends::{
    BackendError, BackendResult, CoordinationBackend, MemoryBackend, PostgresBackend,
};
pub use config::{ControllerConfig, ServiceConfig};
pub use controller::{ControllerError, TaskController, TaskReport};
pub use lifecycle::{
    EventConsumer, EventConsumerConfig, TaskGroupStatus, TrackerRegistry, Workflow,
    WorkflowStatus, WorkflowTracker,
};
pub use messages::{BackendEvent, MessageError, NodeConditionRules, TaskUpdate, proto};
pub use operator::{EventSender, NodeConditionSubscriber, OperatorError};
pub use retry::{Backoff, BackoffConfig};
pub use server::{CoordinationServer, ServerOptions};
