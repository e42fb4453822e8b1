use std::sync::Arc;
use std::time::Instant;

use nanobot_config::AppConfig;
use nanobot_store::SessionStore;

use crate::inbox::AgentInbox;
use crate::router::{MessageRouter, RouterStats};
use crate::status::StatusBoard;
use crate::supervisor::Supervisor;

/// Shared gateway state accessible from all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub supervisor: Arc<Supervisor>,
    pub router: Arc<MessageRouter>,
    pub board: Arc<StatusBoard>,
    pub sessions: Arc<SessionStore>,
    pub inbox: AgentInbox,
    pub router_stats: Arc<RouterStats>,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;
