pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod connector;
pub mod inbox;
pub mod router;
pub mod routes;
pub mod server;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support;

pub use bootstrap::Gateway;
pub use connector::Connector;
pub use router::{MessageRouter, OutboundOutcome, PendingDelivery};
pub use server::GatewayServer;
pub use status::StatusBoard;
pub use supervisor::Supervisor;
