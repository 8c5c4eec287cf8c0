//! Follows the node condition rules pushed to one backend.

use std::collections::BTreeMap;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use super::{OperatorResult, backend_request, connect_channel};
use crate::messages::{NodeConditionRules, proto};
use crate::retry::Backoff;

use proto::config_service_client::ConfigServiceClient;

#[derive(Clone)]
pub struct NodeConditionSubscriber {
    backend_name: String,
    rules: watch::Sender<NodeConditionRules>,
}

impl NodeConditionSubscriber {
    pub fn new(backend_name: impl Into<String>) -> Self {
        let (rules, _) = watch::channel(NodeConditionRules::new());
        Self {
            backend_name: backend_name.into(),
            rules,
        }
    }

    /// The most recently pushed rule set.
    pub fn current(&self) -> NodeConditionRules {
        self.rules.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeConditionRules> {
        self.rules.subscribe()
    }

    /// Scheduling predicate against the current rule set.
    pub fn node_is_eligible(&self, node_conditions: &BTreeMap<String, bool>) -> bool {
        self.rules.borrow().node_is_eligible(node_conditions)
    }

    fn apply(&self, message: &proto::NodeConditionsMessage) {
        let rules = NodeConditionRules::from_proto(message);
        debug!(backend = %self.backend_name, rules = rules.len(), "node conditions replaced");
        self.rules.send_replace(rules);
    }

    /// Follow one stream until it ends.
    pub async fn follow(&self, channel: Channel) -> OperatorResult<()> {
        let mut client = ConfigServiceClient::new(channel);
        let request = backend_request(&self.backend_name, proto::NodeConditionRequest {})?;
        let mut stream = client.node_condition_stream(request).await?.into_inner();
        while let Some(message) = stream.message().await? {
            self.apply(&message);
        }
        Ok(())
    }

    /// Keep following `url` until `shutdown` fires.
    pub async fn run(self, url: String, shutdown: CancellationToken) {
        let mut backoff = Backoff::standard();
        loop {
            let session = async {
                let channel = connect_channel(&url).await?;
                backoff.reset();
                self.follow(channel).await
            };
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = session => result,
            };
            let delay = backoff.next_delay();
            if let Err(err) = result {
                warn!(
                    backend = %self.backend_name,
                    error = %err,
                    delay_ms = delay.as_millis(),
                    "node condition stream failed; reconnecting"
                );
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(backend = %self.backend_name, "node condition subscriber stopped");
    }
}
