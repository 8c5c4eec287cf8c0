//! At-least-once event relay from a backend operator.
//!
//! Every data message stays in the unacked list until the service acks its
//! uuid. A new connection first replays the whole unacked list in its
//! original order, then carries new messages.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use super::{OperatorResult, backend_request, connect_channel};
use crate::messages::{BackendEvent, data_message, proto};
use crate::retry::Backoff;

use proto::listener_service_client::ListenerServiceClient;

#[derive(Default)]
struct SenderState {
    unacked: Vec<proto::ListenerMessage>,
    outbound: Option<mpsc::Sender<proto::ListenerMessage>>,
}

#[derive(Clone)]
pub struct EventSender {
    backend_name: String,
    state: Arc<Mutex<SenderState>>,
}

impl EventSender {
    pub fn new(backend_name: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            state: Arc::new(Mutex::new(SenderState::default())),
        }
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Messages sent but not yet acked.
    pub fn pending(&self) -> usize {
        self.state.lock().expect("event sender poisoned").unacked.len()
    }

    pub fn pending_uuids(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("event sender poisoned")
            .unacked
            .iter()
            .map(|message| message.uuid.clone())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .expect("event sender poisoned")
            .outbound
            .is_some()
    }

    /// Queue `event` for delivery and return its message uuid.
    ///
    /// The message is kept until acked, so it is delivered on the current
    /// connection if there is one, or replayed on the next.
    pub async fn send(&self, event: &BackendEvent) -> OperatorResult<String> {
        let message = data_message(event.to_body()?);
        let uuid = message.uuid.clone();
        let outbound = {
            let mut state = self.state.lock().expect("event sender poisoned");
            state.unacked.push(message.clone());
            state.outbound.clone()
        };
        if let Some(outbound) = outbound {
            if outbound.send(message).await.is_err() {
                debug!(uuid = %uuid, "connection gone; message kept for replay");
            }
        }
        Ok(uuid)
    }

    /// Run one connection until the stream ends.
    ///
    /// Returns `Ok` when the service closes the stream cleanly; the caller
    /// reconnects either way.
    pub async fn run_connection(&self, channel: Channel) -> OperatorResult<()> {
        let (tx, rx) = mpsc::channel(64);
        let replay = {
            let mut state = self.state.lock().expect("event sender poisoned");
            state.outbound = Some(tx);
            state.unacked.clone()
        };
        if !replay.is_empty() {
            info!(backend = %self.backend_name, replay = replay.len(), "replaying unacked events");
        }
        let outbound = futures::stream::iter(replay).chain(ReceiverStream::new(rx));

        let result = self.read_acks(channel, outbound).await;
        self.state.lock().expect("event sender poisoned").outbound = None;
        result
    }

    async fn read_acks(
        &self,
        channel: Channel,
        outbound: impl futures::Stream<Item = proto::ListenerMessage> + Send + 'static,
    ) -> OperatorResult<()> {
        let mut client = ListenerServiceClient::new(channel);
        let request = backend_request(&self.backend_name, outbound)?;
        let mut inbound = client.workflow_listener_stream(request).await?.into_inner();

        while let Some(message) = inbound.message().await? {
            if message.r#type != proto::ListenerMessageType::Ack as i32 {
                warn!(backend = %self.backend_name, uuid = %message.uuid, "ignoring non-ack from service");
                continue;
            }
            let mut state = self.state.lock().expect("event sender poisoned");
            let before = state.unacked.len();
            state.unacked.retain(|pending| pending.uuid != message.uuid);
            if state.unacked.len() == before {
                debug!(uuid = %message.uuid, "ack for unknown message");
            }
        }
        Ok(())
    }

    /// Keep a connection to `url` open until `shutdown` fires.
    pub async fn run(self, url: String, shutdown: CancellationToken) {
        let mut backoff = Backoff::standard();
        loop {
            let session = async {
                let channel = connect_channel(&url).await?;
                backoff.reset();
                self.run_connection(channel).await
            };
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = session => result,
            };
            let delay = backoff.next_delay();
            match result {
                Ok(()) => info!(backend = %self.backend_name, "event stream closed by service"),
                Err(err) => warn!(
                    backend = %self.backend_name,
                    error = %err,
                    pending = self.pending(),
                    delay_ms = delay.as_millis(),
                    "event stream failed; reconnecting"
                ),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.state.lock().expect("event sender poisoned").outbound = None;
        info!(backend = %self.backend_name, pending = self.pending(), "event sender stopped");
    }
}
