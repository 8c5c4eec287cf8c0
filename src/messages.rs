//! Protocol buffer message types and helpers for the coordination streams.
//!
//! This module wraps the generated protobuf types and provides the typed JSON
//! bodies that ride inside [`proto::ListenerMessage`], timestamp conversions,
//! and the key/path conventions shared by the service, operators and task
//! controllers.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::TaskGroupStatus;

/// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("osmo.coordination");
}

/// Metadata key every backend stream must carry.
pub const BACKEND_NAME_METADATA: &str = "backend-name";

/// Metadata key carrying a controller session token.
pub const AUTH_TOKEN_METADATA: &str = "x-osmo-auth";

/// Hash-tagged key of the durable operator event log.
pub const OPERATOR_MESSAGES_KEY: &str = "{osmo}:{message-queue}:operator_messages";

const NODE_CONDITION_QUEUE_PREFIX: &str = "{osmo}:{message-queue}:node_conditions";

/// Per-backend node condition queue key.
pub fn node_condition_queue_key(backend_name: &str) -> String {
    format!("{NODE_CONDITION_QUEUE_PREFIX}:{backend_name}")
}

/// Log ingestion path for one task attempt. Also used as the log record key.
pub fn log_path(workflow_id: &str, task_name: &str, retry_id: u32) -> String {
    format!("/api/logger/workflow/{workflow_id}/osmo_ctrl/{task_name}/retry_id/{retry_id}")
}

/// Errors that can occur while decoding message bodies.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to decode message body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("message is missing its timestamp")]
    MissingTimestamp,
    #[error("invalid timestamp: {seconds}s {nanos}ns")]
    InvalidTimestamp { seconds: i64, nanos: i32 },
    #[error("channel closed")]
    ChannelClosed,
}

pub fn timestamp_from_datetime(time: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: time.timestamp_subsec_nanos() as i32,
    }
}

pub fn datetime_from_timestamp(
    timestamp: &prost_types::Timestamp,
) -> Result<DateTime<Utc>, MessageError> {
    Utc.timestamp_opt(timestamp.seconds, timestamp.nanos.max(0) as u32)
        .single()
        .ok_or(MessageError::InvalidTimestamp {
            seconds: timestamp.seconds,
            nanos: timestamp.nanos,
        })
}

/// Build a data message carrying `body`, stamped now.
pub fn data_message(body: String) -> proto::ListenerMessage {
    proto::ListenerMessage {
        uuid: Uuid::new_v4().to_string(),
        r#type: proto::ListenerMessageType::Data as i32,
        timestamp: Some(timestamp_from_datetime(Utc::now())),
        body,
    }
}

/// Create the ack for a data message: same uuid and timestamp, empty body.
pub fn ack_message(message: &proto::ListenerMessage) -> proto::ListenerMessage {
    proto::ListenerMessage {
        uuid: message.uuid.clone(),
        r#type: proto::ListenerMessageType::Ack as i32,
        timestamp: message.timestamp,
        body: String::new(),
    }
}

/// Typed body of a data [`proto::ListenerMessage`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    TaskUpdate(TaskUpdate),
    Heartbeat { backend: String },
}

impl BackendEvent {
    pub fn to_body(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_body(body: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Status report for one task attempt, as observed by a backend operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub workflow_id: String,
    pub task_name: String,
    pub retry_id: u32,
    pub status: TaskGroupStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Node condition rule set: condition type -> required boolean.
///
/// Always handled as a whole; a push replaces the previous set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeConditionRules(pub BTreeMap<String, bool>);

impl NodeConditionRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, condition: impl Into<String>, required: bool) -> Self {
        self.0.insert(condition.into(), required);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse(payload: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// A node is eligible when every rule's condition is reported with the
    /// required value. Missing conditions make the node ineligible.
    pub fn node_is_eligible(&self, node_conditions: &BTreeMap<String, bool>) -> bool {
        self.0
            .iter()
            .all(|(condition, required)| node_conditions.get(condition) == Some(required))
    }

    pub fn to_proto(&self) -> proto::NodeConditionsMessage {
        proto::NodeConditionsMessage {
            rules: self.0.clone().into_iter().collect(),
            timestamp: Some(timestamp_from_datetime(Utc::now())),
        }
    }

    pub fn from_proto(message: &proto::NodeConditionsMessage) -> Self {
        Self(message.rules.clone().into_iter().collect())
    }
}

impl proto::IoType {
    /// Stable string form used for persisted log rows.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::OsmoCtrl => "OSMO_CTRL",
            Self::Download => "DOWNLOAD",
            Self::Upload => "UPLOAD",
            Self::LogDone => "LOG_DONE",
            Self::Barrier => "BARRIER",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "STDOUT" => Self::Stdout,
            "STDERR" => Self::Stderr,
            "OSMO_CTRL" => Self::OsmoCtrl,
            "DOWNLOAD" => Self::Download,
            "UPLOAD" => Self::Upload,
            "LOG_DONE" => Self::LogDone,
            "BARRIER" => Self::Barrier,
            _ => Self::Unspecified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_keeps_uuid_and_timestamp() {
        let data = data_message("{}".to_string());
        let ack = ack_message(&data);
        assert_eq!(ack.uuid, data.uuid);
        assert_eq!(ack.timestamp, data.timestamp);
        assert_eq!(ack.r#type, proto::ListenerMessageType::Ack as i32);
        assert!(ack.body.is_empty());
    }

    #[test]
    fn test_timestamp_conversion_preserves_nanos() {
        let now = Utc::now();
        let back = datetime_from_timestamp(&timestamp_from_datetime(now)).expect("timestamp");
        assert_eq!(back, now);
    }

    #[test]
    fn test_backend_event_body_shape() {
        let event = BackendEvent::TaskUpdate(TaskUpdate {
            workflow_id: "wf-1".to_string(),
            task_name: "train".to_string(),
            retry_id: 2,
            status: TaskGroupStatus::Failed,
            exit_code: Some(1),
            message: None,
        });
        let body = event.to_body().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(value["type"], "task_update");
        assert_eq!(value["status"], "FAILED");
        assert_eq!(BackendEvent::from_body(&body).expect("decode"), event);
    }

    #[test]
    fn test_node_condition_rules_parse_rejects_malformed() {
        assert!(NodeConditionRules::parse("{not json").is_err());
        assert!(NodeConditionRules::parse(r#"{"Ready": "yes"}"#).is_err());
        let rules = NodeConditionRules::parse(r#"{"Ready": true, "DiskPressure": false}"#)
            .expect("rules");
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_node_eligibility_requires_every_rule() {
        let rules = NodeConditionRules::new()
            .with_rule("Ready", true)
            .with_rule("DiskPressure", false);

        let healthy = BTreeMap::from([
            ("Ready".to_string(), true),
            ("DiskPressure".to_string(), false),
            ("PIDPressure".to_string(), false),
        ]);
        assert!(rules.node_is_eligible(&healthy));

        let pressured = BTreeMap::from([
            ("Ready".to_string(), true),
            ("DiskPressure".to_string(), true),
        ]);
        assert!(!rules.node_is_eligible(&pressured));

        let unknown = BTreeMap::from([("Ready".to_string(), true)]);
        assert!(!rules.node_is_eligible(&unknown));

        assert!(NodeConditionRules::new().node_is_eligible(&BTreeMap::new()));
    }

    #[test]
    fn test_key_conventions() {
        assert_eq!(
            node_condition_queue_key("cluster-a"),
            "{osmo}:{message-queue}:node_conditions:cluster-a"
        );
        assert_eq!(
            log_path("wf-9", "train", 3),
            "/api/logger/workflow/wf-9/osmo_ctrl/train/retry_id/3"
        );
    }
}
