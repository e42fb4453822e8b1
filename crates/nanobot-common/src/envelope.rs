use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConnectorId, ConversationId};

/// One routed unit of message traffic between a bridge and the agent runtime.
///
/// The payload is opaque to the gateway: bridges and the agent agree on its
/// shape, the gateway only routes and orders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub connector_id: ConnectorId,
    pub conversation_id: ConversationId,
    pub direction: Direction,
    /// Monotonic per `(connector_id, conversation_id)`, starting at 1.
    pub sequence: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Envelope {
    pub fn inbound(
        connector_id: ConnectorId,
        conversation_id: ConversationId,
        sequence: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            connector_id,
            conversation_id,
            direction: Direction::Inbound,
            sequence,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build an outbound envelope. The router assigns the sequence number.
    pub fn outbound(
        connector_id: ConnectorId,
        conversation_id: ConversationId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            connector_id,
            conversation_id,
            direction: Direction::Outbound,
            sequence: 0,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Routing key used for ordering and sequence allocation.
    pub fn conversation_key(&self) -> (ConnectorId, ConversationId) {
        (self.connector_id.clone(), self.conversation_id.clone())
    }
}
