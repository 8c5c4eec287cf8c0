//! Backend -> service event relay.
//!
//! Every data message is appended to the durable event log before its ack is
//! sent. If the append fails the stream ends with `UNAVAILABLE`; the backend
//! still holds the message as unacked and redelivers it after reconnecting.

use std::pin::Pin;
use std::time::Instant;

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming, async_trait};
use tracing::{debug, info, warn};

use super::metadata::backend_name;
use crate::backends::{EventLogBackend, NewEvent};
use crate::messages::{
    OPERATOR_MESSAGES_KEY, ack_message, datetime_from_timestamp, proto,
};

/// Outbound buffer per stream; acks are small and the loop waits on the store.
const ACK_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct ListenerServiceImpl<B> {
    backend: B,
}

impl<B> ListenerServiceImpl<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B> proto::listener_service_server::ListenerService for ListenerServiceImpl<B>
where
    B: EventLogBackend + Clone + 'static,
{
    type WorkflowListenerStreamStream =
        Pin<Box<dyn Stream<Item = Result<proto::ListenerMessage, Status>> + Send + 'static>>;

    async fn workflow_listener_stream(
        &self,
        request: Request<Streaming<proto::ListenerMessage>>,
    ) -> Result<Response<Self::WorkflowListenerStreamStream>, Status> {
        let backend_name = backend_name(&request)?;
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);

        info!(backend = %backend_name, "event relay stream opened");
        tokio::spawn(relay_events(
            self.backend.clone(),
            backend_name,
            inbound,
            tx,
        ));

        let outbound = ReceiverStream::new(rx);
        Ok(Response::new(
            Box::pin(outbound) as Self::WorkflowListenerStreamStream
        ))
    }
}

async fn relay_events<B>(
    backend: B,
    backend_name: String,
    mut inbound: Streaming<proto::ListenerMessage>,
    tx: mpsc::Sender<Result<proto::ListenerMessage, Status>>,
) where
    B: EventLogBackend,
{
    let mut relayed = 0u64;
    loop {
        let message = tokio::select! {
            _ = tx.closed() => break,
            message = inbound.message() => message,
        };
        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(status) if status.code() == Code::Cancelled => break,
            Err(status) => {
                warn!(backend = %backend_name, error = %status, "event relay receive error");
                break;
            }
        };

        match proto::ListenerMessageType::try_from(message.r#type) {
            Ok(proto::ListenerMessageType::Data) => {}
            Ok(proto::ListenerMessageType::Ack) => {
                warn!(backend = %backend_name, uuid = %message.uuid, "ignoring ack sent by backend");
                continue;
            }
            _ => {
                warn!(
                    backend = %backend_name,
                    uuid = %message.uuid,
                    message_type = message.r#type,
                    "ignoring message with unknown type"
                );
                continue;
            }
        }

        let now = Utc::now();
        let message_timestamp = match message.timestamp.as_ref().map(datetime_from_timestamp) {
            Some(Ok(timestamp)) => {
                debug!(
                    backend = %backend_name,
                    uuid = %message.uuid,
                    latency_ms = (now - timestamp).num_milliseconds(),
                    "event received"
                );
                timestamp
            }
            Some(Err(err)) => {
                warn!(backend = %backend_name, uuid = %message.uuid, error = %err, "bad event timestamp");
                now
            }
            None => now,
        };

        let started = Instant::now();
        let append = backend
            .append_event(NewEvent {
                stream_key: OPERATOR_MESSAGES_KEY.to_string(),
                backend_name: backend_name.clone(),
                message_uuid: message.uuid.clone(),
                message_timestamp,
                body: message.body.clone(),
            })
            .await;
        if let Err(err) = append {
            warn!(
                backend = %backend_name,
                uuid = %message.uuid,
                error = %err,
                "failed to persist event; closing stream without ack"
            );
            let _ = tx
                .send(Err(Status::unavailable(format!(
                    "failed to persist message {}: {err}",
                    message.uuid
                ))))
                .await;
            return;
        }
        debug!(
            backend = %backend_name,
            uuid = %message.uuid,
            persist_ms = started.elapsed().as_millis(),
            "event persisted"
        );

        if tx.send(Ok(ack_message(&message))).await.is_err() {
            break;
        }
        relayed += 1;
    }
    info!(backend = %backend_name, relayed, "event relay stream closed");
}
