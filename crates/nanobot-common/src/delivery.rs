use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::ConversationId;

/// Confirmation from a bridge that an outbound envelope reached the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub conversation_id: ConversationId,
    pub sequence: u64,
    /// Message id assigned by the external platform, if the bridge reports one.
    #[serde(default)]
    pub platform_message_id: Option<String>,
}

/// Why an outbound envelope was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "reason", content = "detail")]
pub enum NackReason {
    ConnectorStopped,
    ConnectorFailed,
    UnknownConnector,
    QueueFull,
    BridgeRestarted,
    FrameTooLarge,
    /// The bridge took the envelope but never reported a result.
    AckTimeout,
    /// Reason reported by the bridge itself.
    Bridge(String),
}

impl NackReason {
    pub fn as_code(&self) -> &str {
        match self {
            NackReason::ConnectorStopped => "connector-stopped",
            NackReason::ConnectorFailed => "connector-failed",
            NackReason::UnknownConnector => "unknown-connector",
            NackReason::QueueFull => "queue-full",
            NackReason::BridgeRestarted => "bridge-restarted",
            NackReason::FrameTooLarge => "frame-too-large",
            NackReason::AckTimeout => "ack-timeout",
            NackReason::Bridge(reason) => reason,
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

pub type DeliveryResult = std::result::Result<DeliveryAck, NackReason>;
