//! Backend-side clients of the coordination service.
//!
//! A backend operator runs an [`EventSender`] to relay workflow events and a
//! [`NodeConditionSubscriber`] to follow the node condition rules it must
//! apply when scheduling.

pub mod event_sender;
pub mod node_conditions;

use thiserror::Error;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

pub use event_sender::EventSender;
pub use node_conditions::NodeConditionSubscriber;

use crate::messages::{BACKEND_NAME_METADATA, MessageError};

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Status(#[from] tonic::Status),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("invalid backend name {0:?}")]
    InvalidBackendName(String),
}

pub type OperatorResult<T> = Result<T, OperatorError>;

/// Open a channel to the coordination service.
pub async fn connect_channel(url: &str) -> OperatorResult<Channel> {
    let endpoint = Endpoint::from_shared(url.to_string())?;
    Ok(endpoint.connect().await?)
}

/// Wrap `message` in a request carrying the backend name.
pub(crate) fn backend_request<T>(backend_name: &str, message: T) -> OperatorResult<Request<T>> {
    let value = MetadataValue::try_from(backend_name)
        .map_err(|_| OperatorError::InvalidBackendName(backend_name.to_string()))?;
    let mut request = Request::new(message);
    request.metadata_mut().insert(BACKEND_NAME_METADATA, value);
    Ok(request)
}
