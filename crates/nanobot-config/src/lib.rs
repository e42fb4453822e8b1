pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AppConfig, ChannelConfig, ConnectorConfig, GatewayConfig, RestartPolicyConfig, RouterConfig,
    SupervisorConfig,
};
