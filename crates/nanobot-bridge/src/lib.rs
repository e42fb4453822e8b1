pub mod channel;
pub mod codec;
pub mod process;
pub mod protocol;

pub use channel::{BridgeChannel, BridgeSender, ChannelLimits, ChannelStats};
pub use codec::{BridgeCodec, FrameError};
pub use process::{BridgeChild, BridgeSpawner, CommandSpawner, SpawnRequest, SpawnedBridge};
pub use protocol::{
    BRIDGE_PROTOCOL_VERSION, BridgeCapability, BridgeFrame, BridgeHandshake, SessionGrant,
    decode_credential,
};
