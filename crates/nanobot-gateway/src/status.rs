use dashmap::DashMap;
use nanobot_common::{BridgeState, ConnectorId, ConnectorStatus};
use tokio::sync::broadcast;

/// Latest [`ConnectorStatus`] per connector.
///
/// Supervisor tasks are the only writers. Readers get a snapshot straight from
/// the map and never wait on a bridge. State changes are also broadcast so the
/// router and attached agents can react to them.
pub struct StatusBoard {
    statuses: DashMap<ConnectorId, ConnectorStatus>,
    updates: broadcast::Sender<ConnectorStatus>,
}

impl StatusBoard {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            statuses: DashMap::new(),
            updates,
        }
    }

    /// Store `status` and notify subscribers.
    pub fn publish(&self, status: ConnectorStatus) {
        self.statuses
            .insert(status.connector_id.clone(), status.clone());
        // No subscribers is fine.
        let _ = self.updates.send(status);
    }

    /// Store `status` without notifying anyone. Used for heartbeat bookkeeping.
    pub fn refresh(&self, status: ConnectorStatus) {
        self.statuses.insert(status.connector_id.clone(), status);
    }

    pub fn get(&self, connector_id: &ConnectorId) -> Option<ConnectorStatus> {
        self.statuses.get(connector_id).map(|s| s.value().clone())
    }

    pub fn state_of(&self, connector_id: &ConnectorId) -> Option<BridgeState> {
        self.statuses.get(connector_id).map(|s| s.state)
    }

    /// All statuses, ordered by connector id.
    pub fn list(&self) -> Vec<ConnectorStatus> {
        let mut all: Vec<_> = self.statuses.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.connector_id.as_str().cmp(b.connector_id.as_str()));
        all
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorStatus> {
        self.updates.subscribe()
    }
}
