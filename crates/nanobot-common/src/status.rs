use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::ConnectorId;

/// Lifecycle state of a bridge subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Starting,
    Handshaking,
    Ready,
    Degraded,
    Stopped,
    /// Restart budget exhausted. Only an operator can leave this state.
    Failed,
}

impl BridgeState {
    /// States from which the supervisor will not move on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, BridgeState::Stopped | BridgeState::Failed)
    }

    /// True once a startup attempt has settled, one way or the other.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            BridgeState::Ready | BridgeState::Failed | BridgeState::Stopped
        )
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Starting => "starting",
            BridgeState::Handshaking => "handshaking",
            BridgeState::Ready => "ready",
            BridgeState::Degraded => "degraded",
            BridgeState::Stopped => "stopped",
            BridgeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Authentication state of a connector's session with the external platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    #[default]
    Unpaired,
    Pairing,
    Paired,
    Revoked,
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PairingStatus::Unpaired => "unpaired",
            PairingStatus::Pairing => "pairing",
            PairingStatus::Paired => "paired",
            PairingStatus::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// Read-only view of one connector, combining bridge lifecycle and pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorStatus {
    pub connector_id: ConnectorId,
    pub connector_type: String,
    pub state: BridgeState,
    pub pairing: PairingStatus,
    pub required: bool,
    /// Total restarts performed for this connector, across gateway restarts.
    pub restart_count: u32,
    /// Starts in a row that did not reach `Ready`.
    pub consecutive_failures: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// QR or link code the operator has to scan to finish pairing.
    pub pairing_prompt: Option<String>,
    /// Malformed or invalid frames received from the bridge.
    pub protocol_errors: u64,
    pub updated_at: DateTime<Utc>,
}

impl ConnectorStatus {
    pub fn new(connector_id: ConnectorId, connector_type: impl Into<String>, required: bool) -> Self {
        Self {
            connector_id,
            connector_type: connector_type.into(),
            state: BridgeState::Stopped,
            pairing: PairingStatus::Unpaired,
            required,
            restart_count: 0,
            consecutive_failures: 0,
            last_heartbeat: None,
            last_error: None,
            pairing_prompt: None,
            protocol_errors: 0,
            updated_at: Utc::now(),
        }
    }
}
