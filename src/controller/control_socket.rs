//! Local control socket between the user command and the controller.
//!
//! One JSON object per line in each direction. The user side is
//! `osmo-ctrl barrier <name> <count>`, which blocks until the barrier is
//! released or failed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::{debug, info, warn};

use super::connection::ControllerConnection;
use super::{ControllerError, ControllerResult};

/// Longest accepted request line.
const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Barrier { name: String, count: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// What the socket does with a request.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn barrier(&self, name: &str, count: u32) -> ControllerResult<()>;
}

#[async_trait]
impl ControlHandler for ControllerConnection {
    async fn barrier(&self, name: &str, count: u32) -> ControllerResult<()> {
        ControllerConnection::barrier(self, name, count).await
    }
}

pub struct ControlSocket {
    path: PathBuf,
    listener: UnixListener,
}

impl ControlSocket {
    /// Bind at `path`, replacing a stale socket file.
    pub fn bind(path: &Path) -> ControllerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "control socket listening");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires, then remove the socket file.
    pub async fn serve(self, handler: Arc<dyn ControlHandler>, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&handler);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(stream, handler, shutdown).await {
                            debug!(error = %err, "control client ended with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "control socket accept failed"),
            }
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(error = %err, "control socket already removed");
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    handler: Arc<dyn ControlHandler>,
    shutdown: CancellationToken,
) -> ControllerResult<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = framed.next() => line,
        };
        let Some(line) = line else {
            return Ok(());
        };
        let line = line.map_err(|err| ControllerError::Io(std::io::Error::other(err)))?;
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(ControlRequest::Barrier { name, count }) => {
                info!(barrier = %name, count, "barrier requested by user command");
                match handler.barrier(&name, count).await {
                    Ok(()) => ControlResponse::ok(),
                    Err(err) => ControlResponse::error(err.to_string()),
                }
            }
            Err(err) => ControlResponse::error(format!("invalid request: {err}")),
        };
        let encoded = serde_json::to_string(&response)?;
        framed
            .send(encoded)
            .await
            .map_err(|err| ControllerError::Io(std::io::Error::other(err)))?;
    }
}

/// Send one request over the socket at `path` and wait for its reply.
pub async fn send_request(path: &Path, request: &ControlRequest) -> ControllerResult<ControlResponse> {
    let stream = UnixStream::connect(path).await?;
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    framed
        .send(serde_json::to_string(request)?)
        .await
        .map_err(|err| ControllerError::Io(std::io::Error::other(err)))?;
    let line = framed
        .next()
        .await
        .ok_or_else(|| {
            ControllerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control socket closed before replying",
            ))
        })?
        .map_err(|err| ControllerError::Io(std::io::Error::other(err)))?;
    Ok(serde_json::from_str(&line)?)
}

/// Block until barrier `name` with `count` participants is released.
pub async fn request_barrier(path: &Path, name: &str, count: u32) -> ControllerResult<()> {
    let response = send_request(
        path,
        &ControlRequest::Barrier {
            name: name.to_string(),
            count,
        },
    )
    .await?;
    if response.ok {
        Ok(())
    } else {
        Err(ControllerError::BarrierFailed {
            name: name.to_string(),
            reason: response.error.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl ControlHandler for RecordingHandler {
        async fn barrier(&self, name: &str, count: u32) -> ControllerResult<()> {
            self.calls
                .lock()
                .expect("calls poisoned")
                .push((name.to_string(), count));
            if name == "broken" {
                return Err(ControllerError::BarrierFailed {
                    name: name.to_string(),
                    reason: "timed out".to_string(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_barrier_round_trip_over_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ctrl.sock");
        let socket = ControlSocket::bind(&path).expect("bind");
        let handler = Arc::new(RecordingHandler::default());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(socket.serve(handler.clone(), shutdown.clone()));

        request_barrier(&path, "sync", 4).await.expect("released");
        let err = request_barrier(&path, "broken", 2).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(
            *handler.calls.lock().expect("calls poisoned"),
            vec![("sync".to_string(), 4), ("broken".to_string(), 2)]
        );

        shutdown.cancel();
        server.await.expect("join");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_reply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ctrl.sock");
        let socket = ControlSocket::bind(&path).expect("bind");
        let shutdown = CancellationToken::new();
        tokio::spawn(socket.serve(Arc::new(RecordingHandler::default()), shutdown.clone()));

        let stream = UnixStream::connect(&path).await.expect("connect");
        let mut framed = Framed::new(stream, LinesCodec::new());
        framed.send("{\"op\":\"dance\"}".to_string()).await.expect("send");
        let reply: ControlResponse =
            serde_json::from_str(&framed.next().await.expect("reply").expect("line")).expect("json");
        assert!(!reply.ok);
        assert!(reply.error.expect("error").starts_with("invalid request"));
        shutdown.cancel();
    }
}
