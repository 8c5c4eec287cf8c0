//! Controller session with the coordination service.
//!
//! [`ControllerConnection::run`] keeps one session open: it reconnects with
//! capped backoff after failures and fetches a fresh token whenever the
//! service rejects the current one. Log batches and barrier requests go out
//! over whichever session is current; a batch sent while disconnected is
//! handed back to the caller. A sent batch is kept until the service acks
//! it, and unacked batches are resent first on the next session.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::transport::Endpoint;
use tonic::{Code, Request, Streaming, async_trait};
use tracing::{debug, info, warn};

use super::token::TokenSource;
use super::{ControllerError, ControllerResult};
use crate::messages::proto;
use crate::retry::{Backoff, BackoffConfig, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS};

use proto::controller_message::Payload;
use proto::controller_service_client::ControllerServiceClient;
use proto::service_message::Payload as Reply;

/// How long a closing session waits for the service to finish reading.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Destination for shipped log batches.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Send one batch. An unsent batch is returned so it can be requeued;
    /// once accepted, delivery is the sink's job.
    async fn send_logs(&self, batch: Vec<proto::LogMessage>) -> Result<(), Vec<proto::LogMessage>>;
}

type BarrierWaiter = oneshot::Sender<Result<(), String>>;

struct PendingBarrier {
    count: u32,
    waiters: Vec<BarrierWaiter>,
}

struct UnackedBatch {
    sequence: u64,
    messages: Vec<proto::LogMessage>,
}

pub struct ControllerConnection {
    url: String,
    token_header: String,
    tokens: Arc<dyn TokenSource>,
    identity: proto::SessionOpen,
    backoff: BackoffConfig,
    max_backoff: Duration,
    outbound: Mutex<Option<mpsc::Sender<proto::ControllerMessage>>>,
    barriers: Mutex<HashMap<String, PendingBarrier>>,
    unacked: Mutex<VecDeque<UnackedBatch>>,
    next_sequence: AtomicU64,
}

impl ControllerConnection {
    pub fn new(
        url: impl Into<String>,
        token_header: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        identity: proto::SessionOpen,
    ) -> Self {
        Self {
            url: url.into(),
            token_header: token_header.into(),
            tokens,
            identity,
            backoff: BackoffConfig::exponential(DEFAULT_BASE_DELAY_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_DELAY_MS as u64),
            outbound: Mutex::new(None),
            barriers: Mutex::new(HashMap::new()),
            unacked: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig, max_backoff: Duration) -> Self {
        self.backoff = backoff;
        self.max_backoff = max_backoff;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .expect("connection poisoned")
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Log batches sent but not yet acked by the service.
    pub fn unacked_batches(&self) -> usize {
        self.unacked.lock().expect("connection poisoned").len()
    }

    fn acknowledge(&self, sequence: u64) {
        let mut unacked = self.unacked.lock().expect("connection poisoned");
        if let Some(position) = unacked.iter().position(|batch| batch.sequence == sequence) {
            unacked.remove(position);
        }
    }

    fn current_sender(&self) -> Option<mpsc::Sender<proto::ControllerMessage>> {
        self.outbound.lock().expect("connection poisoned").clone()
    }

    fn clear_outbound(&self) {
        self.outbound.lock().expect("connection poisoned").take();
    }

    /// Ask the service to rendezvous on `name` with `count` participants.
    ///
    /// The request survives reconnects: it is re-sent on every new session
    /// until the service answers.
    pub async fn barrier(&self, name: &str, count: u32) -> ControllerResult<()> {
        let (tx, rx) = oneshot::channel();
        // Holding the barrier lock while reading the sender pairs with
        // `open_session`, so each request goes out once per session.
        let sender = {
            let mut barriers = self.barriers.lock().expect("connection poisoned");
            let pending = barriers.entry(name.to_string()).or_insert(PendingBarrier {
                count,
                waiters: Vec::new(),
            });
            pending.waiters.push(tx);
            if pending.waiters.len() == 1 {
                self.current_sender()
            } else {
                None
            }
        };
        if let Some(sender) = sender {
            let _ = sender.send(barrier_message(name, count)).await;
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(ControllerError::BarrierFailed {
                name: name.to_string(),
                reason,
            }),
            Err(_) => Err(ControllerError::NotConnected),
        }
    }

    fn resolve_barrier(&self, name: &str, result: Result<(), String>) {
        let pending = self
            .barriers
            .lock()
            .expect("connection poisoned")
            .remove(name);
        match pending {
            Some(pending) => {
                for waiter in pending.waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            None => debug!(barrier = %name, "reply for unknown barrier"),
        }
    }

    fn build_request(
        &self,
        token: Option<&str>,
        outbound: ReceiverStream<proto::ControllerMessage>,
    ) -> ControllerResult<Request<ReceiverStream<proto::ControllerMessage>>> {
        let mut request = Request::new(outbound);
        if let Some(token) = token {
            let key = MetadataKey::from_bytes(self.token_header.as_bytes())
                .map_err(|_| ControllerError::InvalidHeader(self.token_header.clone()))?;
            let value = MetadataValue::try_from(token)
                .map_err(|_| ControllerError::InvalidHeader(self.token_header.clone()))?;
            request.metadata_mut().insert(key, value);
        }
        Ok(request)
    }

    async fn open_session(
        &self,
        token: Option<&str>,
    ) -> ControllerResult<Streaming<proto::ServiceMessage>> {
        let channel = Endpoint::from_shared(self.url.clone())?.connect().await?;
        let mut client = ControllerServiceClient::new(channel);

        let (tx, rx) = mpsc::channel(64);
        let open = proto::ControllerMessage {
            payload: Some(Payload::Open(self.identity.clone())),
        };
        let _ = tx.send(open).await;

        let request = self.build_request(token, ReceiverStream::new(rx))?;
        let inbound = match client.session(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::Unauthenticated => {
                return Err(ControllerError::Unauthenticated(status.message().to_string()));
            }
            Err(status) => return Err(status.into()),
        };
        // Unacked batches go out ahead of anything sent on this session;
        // `send_logs` is refused until the sender is published below.
        let resend_logs: Vec<proto::ControllerMessage> = self
            .unacked
            .lock()
            .expect("connection poisoned")
            .iter()
            .map(|batch| logs_message(batch.sequence, batch.messages.clone()))
            .collect();
        if !resend_logs.is_empty() {
            info!(batches = resend_logs.len(), "resending unacked log batches");
        }
        for message in resend_logs {
            if tx.send(message).await.is_err() {
                return Err(ControllerError::NotConnected);
            }
        }

        let resend: Vec<(String, u32)> = {
            let barriers = self.barriers.lock().expect("connection poisoned");
            *self.outbound.lock().expect("connection poisoned") = Some(tx.clone());
            barriers
                .iter()
                .map(|(name, pending)| (name.clone(), pending.count))
                .collect()
        };
        for (name, count) in resend {
            let _ = tx.send(barrier_message(&name, count)).await;
        }
        Ok(inbound)
    }

    async fn read_replies(&self, mut inbound: Streaming<proto::ServiceMessage>) -> ControllerResult<()> {
        while let Some(message) = inbound.message().await? {
            match message.payload {
                Some(Reply::BarrierReleased(released)) => {
                    debug!(barrier = %released.name, "barrier released");
                    self.resolve_barrier(&released.name, Ok(()));
                }
                Some(Reply::BarrierFailed(failed)) => {
                    warn!(barrier = %failed.name, reason = %failed.reason, "barrier failed");
                    self.resolve_barrier(&failed.name, Err(failed.reason));
                }
                Some(Reply::LogAck(ack)) => self.acknowledge(ack.sequence),
                None => {}
            }
        }
        Ok(())
    }

    /// Keep a session open until `shutdown` fires, then close it after the
    /// service has read everything already sent.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(self.backoff, self.max_backoff);
        let mut token: Option<String> = None;
        let mut refresh = true;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if refresh {
                match self.tokens.fresh_token().await {
                    Ok(fresh) => {
                        token = fresh;
                        refresh = false;
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();
                        warn!(error = %err, delay_ms = delay.as_millis(), "token refresh failed");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                }
            }

            let opened = tokio::select! {
                _ = shutdown.cancelled() => break,
                opened = self.open_session(token.as_deref()) => opened,
            };
            match opened {
                Ok(inbound) => {
                    backoff.reset();
                    info!(url = %self.url, task = %self.identity.task_name, "controller session open");
                    let reader = self.read_replies(inbound);
                    tokio::pin!(reader);
                    let ended = tokio::select! {
                        ended = &mut reader => ended,
                        _ = shutdown.cancelled() => {
                            self.clear_outbound();
                            let _ = tokio::time::timeout(CLOSE_GRACE, &mut reader).await;
                            break;
                        }
                    };
                    self.clear_outbound();
                    match ended {
                        Ok(()) => info!("controller session closed by service"),
                        Err(status) => warn!(error = %status, "controller session failed"),
                    }
                }
                Err(ControllerError::Unauthenticated(reason)) => {
                    warn!(reason = %reason, "controller session rejected; refreshing token");
                    refresh = true;
                }
                Err(err) => warn!(error = %err, "controller session connect failed"),
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.clear_outbound();
        let abandoned: Vec<String> = self
            .barriers
            .lock()
            .expect("connection poisoned")
            .keys()
            .cloned()
            .collect();
        for name in abandoned {
            self.resolve_barrier(&name, Err("controller shutting down".to_string()));
        }
        info!("controller connection stopped");
    }
}

#[async_trait]
impl LogSink for ControllerConnection {
    async fn send_logs(&self, batch: Vec<proto::LogMessage>) -> Result<(), Vec<proto::LogMessage>> {
        // Registering under the outbound lock means a session that ends
        // after this point finds the batch when the next one opens.
        let (sender, sequence) = {
            let outbound = self.outbound.lock().expect("connection poisoned");
            let Some(sender) = outbound.clone() else {
                return Err(batch);
            };
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            self.unacked
                .lock()
                .expect("connection poisoned")
                .push_back(UnackedBatch {
                    sequence,
                    messages: batch.clone(),
                });
            (sender, sequence)
        };
        if sender.send(logs_message(sequence, batch)).await.is_err() {
            debug!(sequence, "session closed mid-send; batch kept for resend");
        }
        Ok(())
    }
}

fn logs_message(sequence: u64, messages: Vec<proto::LogMessage>) -> proto::ControllerMessage {
    proto::ControllerMessage {
        payload: Some(Payload::Logs(proto::LogBatch { messages, sequence })),
    }
}

fn barrier_message(name: &str, count: u32) -> proto::ControllerMessage {
    proto::ControllerMessage {
        payload: Some(Payload::Barrier(proto::BarrierRequest {
            name: name.to_string(),
            count,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::token::NoToken;

    fn connection() -> ControllerConnection {
        ControllerConnection::new(
            "http://127.0.0.1:1",
            "x-osmo-auth",
            Arc::new(NoToken),
            proto::SessionOpen {
                workflow_id: "wf".to_string(),
                group_name: "g".to_string(),
                task_name: "t".to_string(),
                retry_id: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_send_while_disconnected_returns_batch() {
        let connection = connection();
        let batch = vec![proto::LogMessage {
            source: "t".to_string(),
            time: None,
            text: "hello".to_string(),
            io_type: proto::IoType::Stdout as i32,
        }];
        let returned = connection.send_logs(batch.clone()).await.unwrap_err();
        assert_eq!(returned, batch);
        assert!(!connection.is_connected());
        assert_eq!(connection.unacked_batches(), 0);
    }

    #[tokio::test]
    async fn test_sent_batches_held_until_acked() {
        let connection = connection();
        let (tx, mut rx) = mpsc::channel(4);
        *connection.outbound.lock().expect("connection poisoned") = Some(tx);

        for text in ["a", "b"] {
            let batch = vec![proto::LogMessage {
                text: text.to_string(),
                ..Default::default()
            }];
            assert!(connection.send_logs(batch).await.is_ok());
        }
        assert_eq!(connection.unacked_batches(), 2);

        let mut sequences = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Some(Payload::Logs(batch)) = message.payload {
                sequences.push(batch.sequence);
            }
        }
        assert_eq!(sequences, vec![1, 2]);

        connection.acknowledge(2);
        assert_eq!(connection.unacked_batches(), 1);
        connection.acknowledge(2);
        connection.acknowledge(1);
        assert_eq!(connection.unacked_batches(), 0);

        // A session that went away keeps the batch for the next one.
        drop(rx);
        let batch = vec![proto::LogMessage::default()];
        assert!(connection.send_logs(batch).await.is_ok());
        assert_eq!(connection.unacked_batches(), 1);
    }

    #[test]
    fn test_rejects_invalid_header_name() {
        let connection = ControllerConnection::new(
            "http://127.0.0.1:1",
            "bad header",
            Arc::new(NoToken),
            proto::SessionOpen::default(),
        );
        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(
            connection.build_request(Some("token"), ReceiverStream::new(rx)),
            Err(ControllerError::InvalidHeader(_))
        ));
    }
}
