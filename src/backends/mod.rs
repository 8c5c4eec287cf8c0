//! Durable store implementations for the coordination services.

mod base;
mod memory;
mod postgres;

pub use base::{
    BackendError, BackendResult, CoordinationBackend, EventLogBackend, EventRecord, NewEvent,
    NodeConditionBackend, TaskLogBackend, TaskLogLine,
};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
