//! In-pod controller sessions.
//!
//! The first message of a session must be `open`; it names the task attempt
//! whose logs the session carries. After that the controller streams log
//! batches and barrier requests. The service acks each log batch once it is
//! persisted and answers barrier requests with released/failed replies on
//! the same stream.

use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming, async_trait};
use tracing::{debug, info, warn};

use super::barrier::{BarrierKey, BarrierRegistry};
use super::metadata::header_value;
use crate::backends::{TaskLogBackend, TaskLogLine};
use crate::messages::{AUTH_TOKEN_METADATA, datetime_from_timestamp, log_path, proto};

use proto::controller_message::Payload;
use proto::service_message::Payload as Reply;

type ReplySender = mpsc::Sender<Result<proto::ServiceMessage, Status>>;

#[derive(Clone)]
pub struct ControllerServiceImpl<B> {
    backend: B,
    barriers: Arc<BarrierRegistry>,
    tokens: Option<Arc<Vec<String>>>,
}

impl<B> ControllerServiceImpl<B> {
    pub fn new(backend: B, barriers: Arc<BarrierRegistry>, tokens: Option<Vec<String>>) -> Self {
        Self {
            backend,
            barriers,
            tokens: tokens.map(Arc::new),
        }
    }

    fn authorize<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let Some(tokens) = &self.tokens else {
            return Ok(());
        };
        match header_value(request, AUTH_TOKEN_METADATA) {
            Some(token) if tokens.iter().any(|allowed| *allowed == token) => Ok(()),
            Some(_) => Err(Status::unauthenticated("controller token rejected")),
            None => Err(Status::unauthenticated("missing controller token")),
        }
    }
}

#[async_trait]
impl<B> proto::controller_service_server::ControllerService for ControllerServiceImpl<B>
where
    B: TaskLogBackend + Clone + 'static,
{
    type SessionStream =
        Pin<Box<dyn Stream<Item = Result<proto::ServiceMessage, Status>> + Send + 'static>>;

    async fn session(
        &self,
        request: Request<Streaming<proto::ControllerMessage>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        self.authorize(&request)?;
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await
            .map_err(|err| Status::internal(format!("failed to read session open: {err}")))?
            .ok_or_else(|| Status::invalid_argument("missing session open"))?;
        let open = match first.payload {
            Some(Payload::Open(open)) => open,
            _ => {
                return Err(Status::failed_precondition(
                    "expected open as first session message",
                ));
            }
        };
        if open.workflow_id.is_empty() || open.task_name.is_empty() {
            return Err(Status::invalid_argument(
                "session open requires workflow_id and task_name",
            ));
        }

        info!(
            workflow_id = %open.workflow_id,
            task = %open.task_name,
            retry_id = open.retry_id,
            "controller session opened"
        );

        let (tx, rx) = mpsc::channel(64);
        let session = Session {
            log_key: log_path(&open.workflow_id, &open.task_name, open.retry_id),
            open,
            backend: self.backend.clone(),
            barriers: Arc::clone(&self.barriers),
            tx,
        };
        tokio::spawn(session.run(inbound));

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::SessionStream
        ))
    }
}

struct Session<B> {
    open: proto::SessionOpen,
    log_key: String,
    backend: B,
    barriers: Arc<BarrierRegistry>,
    tx: ReplySender,
}

impl<B> Session<B>
where
    B: TaskLogBackend + Clone + 'static,
{
    async fn run(self, mut inbound: Streaming<proto::ControllerMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.tx.closed() => break,
                message = inbound.message() => message,
            };
            let payload = match message {
                Ok(Some(message)) => message.payload,
                Ok(None) => break,
                Err(status) if status.code() == Code::Cancelled => break,
                Err(status) => {
                    warn!(log_key = %self.log_key, error = %status, "controller session receive error");
                    break;
                }
            };
            match payload {
                Some(Payload::Logs(batch)) => {
                    let sequence = batch.sequence;
                    if let Err(status) = self.store_logs(batch).await {
                        let _ = self.tx.send(Err(status)).await;
                        return;
                    }
                    let ack = proto::ServiceMessage {
                        payload: Some(Reply::LogAck(proto::LogAck { sequence })),
                    };
                    if self.tx.send(Ok(ack)).await.is_err() {
                        break;
                    }
                }
                Some(Payload::Barrier(request)) => self.spawn_barrier(request),
                Some(Payload::Open(_)) => {
                    warn!(log_key = %self.log_key, "ignoring repeated session open");
                }
                None => {
                    warn!(log_key = %self.log_key, "ignoring empty controller message");
                }
            }
        }
        info!(log_key = %self.log_key, "controller session closed");
    }

    async fn store_logs(&self, batch: proto::LogBatch) -> Result<(), Status> {
        let received = Utc::now();
        let mut done = false;
        let mut lines = Vec::with_capacity(batch.messages.len());
        for message in batch.messages {
            let io_type = proto::IoType::try_from(message.io_type).unwrap_or(proto::IoType::Unspecified);
            if io_type == proto::IoType::LogDone {
                done = true;
                continue;
            }
            let time = message
                .time
                .as_ref()
                .and_then(|time| datetime_from_timestamp(time).ok())
                .unwrap_or(received);
            lines.push(TaskLogLine {
                source: message.source,
                io_type: io_type.as_label().to_string(),
                time,
                text: message.text,
            });
        }

        if !lines.is_empty() {
            self.backend
                .append_task_logs(&self.log_key, &lines)
                .await
                .map_err(|err| {
                    warn!(log_key = %self.log_key, error = %err, "failed to persist task logs");
                    Status::unavailable(format!("failed to persist task logs: {err}"))
                })?;
            debug!(log_key = %self.log_key, lines = lines.len(), "task logs persisted");
        }

        if done {
            self.backend
                .close_task_log(&self.log_key)
                .await
                .map_err(|err| Status::unavailable(format!("failed to close task log: {err}")))?;
            info!(log_key = %self.log_key, "task log closed");
        }
        Ok(())
    }

    fn spawn_barrier(&self, request: proto::BarrierRequest) {
        let key = BarrierKey::new(
            self.open.workflow_id.clone(),
            self.open.group_name.clone(),
            request.name.clone(),
        );
        let task_name = self.open.task_name.clone();
        let barriers = Arc::clone(&self.barriers);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let reply = match barriers.wait(key, &task_name, request.count).await {
                Ok(()) => Reply::BarrierReleased(proto::BarrierReleased { name: request.name }),
                Err(err) => {
                    warn!(task = %task_name, barrier = %request.name, error = %err, "barrier failed");
                    Reply::BarrierFailed(proto::BarrierFailed {
                        name: request.name,
                        reason: err.to_string(),
                    })
                }
            };
            let _ = tx
                .send(Ok(proto::ServiceMessage {
                    payload: Some(reply),
                }))
                .await;
        });
    }
}
