//! In-pod task controller.
//!
//! The controller runs next to the user command inside the task pod. It
//! stages inputs, runs the command while shipping its output, answers
//! barrier requests from the command over a local socket, and stages outputs
//! once the command is done. Phases run strictly in that order.

pub mod connection;
#[cfg(unix)]
pub mod control_socket;
pub mod exec;
pub mod log_buffer;
pub mod rsync;
pub mod runner;
pub mod staging;
pub mod token;

use thiserror::Error;

pub use connection::{ControllerConnection, LogSink};
pub use exec::{ExecOutcome, run_command};
pub use log_buffer::{DEFAULT_LOG_BUFFER_SIZE, LogBuffer};
pub use rsync::{RsyncDriver, RsyncOptions};
pub use runner::{TaskController, TaskReport, flush_once};
pub use staging::{DataDriver, DriverRegistry, LocalDriver, StagingError};
pub use token::{HttpTokenSource, NoToken, StaticToken, TokenSource};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Status(#[from] tonic::Status),
    #[error("session rejected: {0}")]
    Unauthenticated(String),
    #[error("not connected to the service")]
    NotConnected,
    #[error("token refresh failed: {0}")]
    Token(String),
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error("barrier {name} failed: {reason}")]
    BarrierFailed { name: String, reason: String },
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("invalid exit actions: {0}")]
    ExitActions(String),
    #[error("empty command")]
    EmptyCommand,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
