//! gRPC coordination server.
//!
//! [`CoordinationServer`] hosts the three coordination services on one
//! listener, plus the standard gRPC health service:
//!
//! - `ListenerService`: backend operators relay workflow events; each data
//!   message is persisted before it is acked.
//! - `ConfigService`: node condition rule sets are pushed to each backend.
//! - `ControllerService`: in-pod controllers stream logs and rendezvous on
//!   barriers.

pub mod barrier;
pub mod controller;
pub mod listener;
pub mod metadata;
pub mod node_conditions;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::{error, info, warn};

pub use barrier::{BarrierError, BarrierKey, BarrierRegistry};
pub use controller::ControllerServiceImpl;
pub use listener::ListenerServiceImpl;
pub use node_conditions::{ConfigServiceImpl, NodeConditionOptions};

use crate::backends::CoordinationBackend;
use crate::config::DEFAULT_BARRIER_TIMEOUT_MS;
use crate::messages::proto;
use crate::retry::{BackoffConfig, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS};
use proto::config_service_server::ConfigServiceServer;
use proto::controller_service_server::ControllerServiceServer;
use proto::listener_service_server::ListenerServiceServer;

/// Tunables for the coordination services.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Blocking pop timeout on node condition queues.
    pub pop_timeout: Duration,
    /// Per-stream backoff after queue errors.
    pub backoff: BackoffConfig,
    pub max_backoff: Duration,
    /// How long a barrier waits for the remaining participants.
    pub barrier_timeout: Duration,
    /// Tokens accepted on controller sessions; `None` accepts any session.
    pub controller_tokens: Option<Vec<String>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::exponential(DEFAULT_BASE_DELAY_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_DELAY_MS as u64),
            barrier_timeout: Duration::from_millis(DEFAULT_BARRIER_TIMEOUT_MS),
            controller_tokens: None,
        }
    }
}

impl ServerOptions {
    fn node_condition_options(&self) -> NodeConditionOptions {
        NodeConditionOptions {
            pop_timeout: self.pop_timeout,
            backoff: self.backoff,
            max_backoff: self.max_backoff,
        }
    }
}

/// Running coordination server.
///
/// ```ignore
/// let server = CoordinationServer::start(None, MemoryBackend::new(), ServerOptions::default()).await?;
/// let addr = server.addr();
/// // ... backends connect to addr ...
/// server.shutdown().await;
/// ```
pub struct CoordinationServer {
    addr: SocketAddr,
    barriers: Arc<BarrierRegistry>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    server_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationServer {
    /// Start serving on `bind_addr`.
    ///
    /// If `bind_addr` is None, binds to localhost on an ephemeral port.
    /// The actual bound address can be retrieved with [`Self::addr`].
    pub async fn start<B>(
        bind_addr: Option<SocketAddr>,
        backend: B,
        options: ServerOptions,
    ) -> AnyResult<Arc<Self>>
    where
        B: CoordinationBackend,
    {
        let bind_addr =
            bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));

        let listener = TcpListener::bind(bind_addr)
            .await
            .context("failed to bind coordination listener")?;

        let addr = listener
            .local_addr()
            .context("failed to resolve coordination addr")?;

        info!(%addr, "coordination server starting");

        let barriers = Arc::new(BarrierRegistry::new(options.barrier_timeout));
        let listener_service = ListenerServiceImpl::new(backend.clone());
        let config_service = ConfigServiceImpl::new(backend.clone(), options.node_condition_options());
        let controller_service = ControllerServiceImpl::new(
            backend,
            Arc::clone(&barriers),
            options.controller_tokens.clone(),
        );

        let (mut health_reporter, health_service) = health_reporter();
        health_reporter
            .set_serving::<ListenerServiceServer<ListenerServiceImpl<B>>>()
            .await;
        health_reporter
            .set_serving::<ConfigServiceServer<ConfigServiceImpl<B>>>()
            .await;
        health_reporter
            .set_serving::<ControllerServiceServer<ControllerServiceImpl<B>>>()
            .await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let result = Server::builder()
                .add_service(health_service)
                .add_service(ListenerServiceServer::new(listener_service))
                .add_service(ConfigServiceServer::new(config_service))
                .add_service(ControllerServiceServer::new(controller_service))
                .serve_with_incoming_shutdown(incoming, shutdown)
                .await;
            if let Err(err) = result {
                error!(?err, "coordination server exited with error");
            }
        });

        Ok(Arc::new(Self {
            addr,
            barriers,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            server_handle: Mutex::new(Some(server)),
        }))
    }

    /// Get the address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn barriers(&self) -> &Arc<BarrierRegistry> {
        &self.barriers
    }

    /// Gracefully shut down the server.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.lock().await.take()
            && let Err(err) = handle.await
        {
            warn!(?err, "coordination server task join failed");
        }
    }
}
