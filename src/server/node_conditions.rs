//! Service -> backend node condition push.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, async_trait};
use tracing::{debug, info, warn};

use super::metadata::backend_name;
use crate::backends::NodeConditionBackend;
use crate::messages::{NodeConditionRules, proto};
use crate::retry::{Backoff, BackoffConfig};

#[derive(Clone, Debug)]
pub struct NodeConditionOptions {
    pub pop_timeout: Duration,
    pub backoff: BackoffConfig,
    pub max_backoff: Duration,
}

#[derive(Clone)]
pub struct ConfigServiceImpl<B> {
    backend: B,
    options: NodeConditionOptions,
}

impl<B> ConfigServiceImpl<B> {
    pub fn new(backend: B, options: NodeConditionOptions) -> Self {
        Self { backend, options }
    }
}

#[async_trait]
impl<B> proto::config_service_server::ConfigService for ConfigServiceImpl<B>
where
    B: NodeConditionBackend + Clone + 'static,
{
    type NodeConditionStreamStream =
        Pin<Box<dyn Stream<Item = Result<proto::NodeConditionsMessage, Status>> + Send + 'static>>;

    async fn node_condition_stream(
        &self,
        request: Request<proto::NodeConditionRequest>,
    ) -> Result<Response<Self::NodeConditionStreamStream>, Status> {
        let backend_name = backend_name(&request)?;
        let (tx, rx) = mpsc::channel(4);

        info!(backend = %backend_name, "node condition stream opened");
        tokio::spawn(push_node_conditions(
            self.backend.clone(),
            backend_name,
            self.options.clone(),
            tx,
        ));

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::NodeConditionStreamStream
        ))
    }
}

type PushSender = mpsc::Sender<Result<proto::NodeConditionsMessage, Status>>;

/// Per-stream loop: initial full rule set, then queued replacements.
///
/// The backoff counter lives here, so one backend's queue errors never delay
/// another backend's stream.
async fn push_node_conditions<B>(
    backend: B,
    backend_name: String,
    options: NodeConditionOptions,
    tx: PushSender,
) where
    B: NodeConditionBackend,
{
    let mut backoff = Backoff::new(options.backoff, options.max_backoff);

    let initial = loop {
        let fetched = tokio::select! {
            _ = tx.closed() => return,
            fetched = backend.get_node_conditions(&backend_name) => fetched,
        };
        match fetched {
            Ok(rules) => break rules,
            Err(err) => {
                if !wait_backoff(&tx, &mut backoff, &backend_name, err.to_string()).await {
                    return;
                }
            }
        }
    };
    backoff.reset();
    if !send_rules(&tx, &backend_name, &initial).await {
        return;
    }

    loop {
        let popped = tokio::select! {
            _ = tx.closed() => break,
            popped = backend.pop_node_condition_update(&backend_name, options.pop_timeout) => popped,
        };
        match popped {
            Ok(None) => backoff.reset(),
            Ok(Some(payload)) => {
                backoff.reset();
                match NodeConditionRules::parse(&payload) {
                    Ok(rules) => {
                        if !send_rules(&tx, &backend_name, &rules).await {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(
                            backend = %backend_name,
                            error = %err,
                            payload_len = payload.len(),
                            "skipping malformed node condition payload"
                        );
                    }
                }
            }
            Err(err) => {
                if !wait_backoff(&tx, &mut backoff, &backend_name, err.to_string()).await {
                    break;
                }
            }
        }
    }
    info!(backend = %backend_name, "node condition stream closed");
}

async fn send_rules(tx: &PushSender, backend_name: &str, rules: &NodeConditionRules) -> bool {
    debug!(backend = %backend_name, rules = rules.len(), "pushing node conditions");
    tx.send(Ok(rules.to_proto())).await.is_ok()
}

// Sleep out the next backoff delay. Returns false if the client went away.
async fn wait_backoff(
    tx: &PushSender,
    backoff: &mut Backoff,
    backend_name: &str,
    err: String,
) -> bool {
    let delay = backoff.next_delay();
    warn!(
        backend = %backend_name,
        error = %err,
        attempt = backoff.attempt(),
        delay_ms = delay.as_millis(),
        "node condition queue error; backing off"
    );
    tokio::select! {
        _ = tx.closed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
