pub mod delivery;
pub mod envelope;
pub mod error;
pub mod status;
pub mod types;

pub use delivery::{DeliveryAck, DeliveryResult, NackReason};
pub use envelope::{Direction, Envelope};
pub use error::{Error, Result};
pub use status::{BridgeState, ConnectorStatus, PairingStatus};
pub use types::{ConnectorId, ConversationId};
