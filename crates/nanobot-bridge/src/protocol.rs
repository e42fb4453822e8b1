use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nanobot_common::{
    ConnectorId, ConversationId, DeliveryAck, Direction, Envelope, Error, PairingStatus, Result,
};
use serde::{Deserialize, Serialize};

/// Wire protocol version spoken between the gateway and bridge processes.
pub const BRIDGE_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BridgeCapability {
    Pair,
    Send,
    Receive,
    Heartbeat,
    DeliveryReceipts,
}

/// First frame a bridge sends after start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeHandshake {
    pub protocol_version: u32,
    pub bridge_name: String,
    pub bridge_version: String,
    pub connector_type: String,
    #[serde(default)]
    pub capabilities: Vec<BridgeCapability>,
}

impl BridgeHandshake {
    pub fn validate(&self, expected_type: &str) -> Result<()> {
        if self.protocol_version != BRIDGE_PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {}, expected {}",
                self.protocol_version, BRIDGE_PROTOCOL_VERSION
            )));
        }

        if self.bridge_name.trim().is_empty() {
            return Err(Error::Protocol("bridge_name cannot be empty".into()));
        }

        if self.bridge_version.trim().is_empty() {
            return Err(Error::Protocol("bridge_version cannot be empty".into()));
        }

        if self.connector_type != expected_type {
            return Err(Error::Protocol(format!(
                "bridge serves connector type '{}', expected '{}'",
                self.connector_type, expected_type
            )));
        }

        Ok(())
    }

    pub fn supports(&self, capability: &BridgeCapability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Persisted session handed back to a bridge so it can resume without pairing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionGrant {
    pub status: PairingStatus,
    /// Base64 of the opaque credential blob.
    pub credential: String,
}

impl SessionGrant {
    pub fn new(status: PairingStatus, credential: &[u8]) -> Self {
        Self {
            status,
            credential: BASE64.encode(credential),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    // bridge -> gateway
    Handshake {
        payload: BridgeHandshake,
    },
    Heartbeat {
        #[serde(default)]
        sent_at: Option<DateTime<Utc>>,
    },
    PairPrompt {
        code: String,
    },
    PairResult {
        #[serde(default)]
        request_id: Option<String>,
        success: bool,
        /// Base64 of the credential blob to persist.
        #[serde(default)]
        credential: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    SessionRevoked {
        reason: String,
    },
    InboundEnvelope {
        envelope: Envelope,
    },
    DeliveryAck(DeliveryAck),
    DeliveryNack {
        conversation_id: ConversationId,
        sequence: u64,
        reason: String,
    },
    Error {
        code: String,
        message: String,
    },

    // gateway -> bridge
    HandshakeAck {
        protocol_version: u32,
        accepted: bool,
        #[serde(default)]
        message: Option<String>,
        heartbeat_interval_secs: u64,
        #[serde(default)]
        session: Option<SessionGrant>,
    },
    PairRequest {
        request_id: String,
    },
    OutboundEnvelope {
        envelope: Envelope,
    },
    Shutdown {
        grace_period_ms: u64,
    },
}

impl BridgeFrame {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeFrame::Handshake { .. } => "handshake",
            BridgeFrame::Heartbeat { .. } => "heartbeat",
            BridgeFrame::PairPrompt { .. } => "pair_prompt",
            BridgeFrame::PairResult { .. } => "pair_result",
            BridgeFrame::SessionRevoked { .. } => "session_revoked",
            BridgeFrame::InboundEnvelope { .. } => "inbound_envelope",
            BridgeFrame::DeliveryAck(_) => "delivery_ack",
            BridgeFrame::DeliveryNack { .. } => "delivery_nack",
            BridgeFrame::Error { .. } => "error",
            BridgeFrame::HandshakeAck { .. } => "handshake_ack",
            BridgeFrame::PairRequest { .. } => "pair_request",
            BridgeFrame::OutboundEnvelope { .. } => "outbound_envelope",
            BridgeFrame::Shutdown { .. } => "shutdown",
        }
    }

    /// True for frames a bridge is allowed to send to the gateway.
    pub fn is_bridge_originated(&self) -> bool {
        !matches!(
            self,
            BridgeFrame::HandshakeAck { .. }
                | BridgeFrame::PairRequest { .. }
                | BridgeFrame::OutboundEnvelope { .. }
                | BridgeFrame::Shutdown { .. }
        )
    }

    /// Validate a frame received from the bridge serving `connector_id`.
    pub fn validate_from_bridge(&self, connector_id: &ConnectorId) -> Result<()> {
        if !self.is_bridge_originated() {
            return Err(Error::Protocol(format!(
                "bridge sent gateway-only frame '{}'",
                self.kind()
            )));
        }

        match self {
            BridgeFrame::PairPrompt { code } if code.trim().is_empty() => {
                Err(Error::Protocol("pair_prompt code cannot be empty".into()))
            }
            BridgeFrame::PairResult {
                success: true,
                credential,
                ..
            } => match credential.as_deref().map(decode_credential) {
                Some(Ok(blob)) if !blob.is_empty() => Ok(()),
                Some(Ok(_)) => Err(Error::Protocol("pair_result credential is empty".into())),
                Some(Err(e)) => Err(e),
                None => Err(Error::Protocol(
                    "successful pair_result carries no credential".into(),
                )),
            },
            BridgeFrame::InboundEnvelope { envelope } => {
                if &envelope.connector_id != connector_id {
                    return Err(Error::Protocol(format!(
                        "envelope for connector '{}' arrived on bridge for '{}'",
                        envelope.connector_id, connector_id
                    )));
                }
                if envelope.direction != Direction::Inbound {
                    return Err(Error::Protocol(
                        "inbound_envelope must have direction 'inbound'".into(),
                    ));
                }
                validate_position(&envelope.conversation_id, envelope.sequence)
            }
            BridgeFrame::DeliveryAck(ack) => validate_position(&ack.conversation_id, ack.sequence),
            BridgeFrame::DeliveryNack {
                conversation_id,
                sequence,
                ..
            } => validate_position(conversation_id, *sequence),
            _ => Ok(()),
        }
    }

    pub fn parse_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::Protocol(format!("invalid bridge frame json: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

fn validate_position(conversation_id: &ConversationId, sequence: u64) -> Result<()> {
    if conversation_id.is_blank() {
        return Err(Error::Protocol("conversation_id cannot be empty".into()));
    }
    if sequence == 0 {
        return Err(Error::Protocol("sequence numbers start at 1".into()));
    }
    Ok(())
}

/// Decode a base64 credential carried in a frame.
pub fn decode_credential(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| Error::Protocol(format!("invalid credential encoding: {e}")))
}
