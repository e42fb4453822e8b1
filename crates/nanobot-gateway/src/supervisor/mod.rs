//! Bridge process supervision: one task per active connector.

pub mod backoff;
pub mod instance;

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nanobot_common::{BridgeState, ConnectorId, Error, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connector::Connector;
use instance::{BridgeInstance, InstanceCommand, InstanceContext, initial_status};

pub use backoff::Backoff;

struct InstanceHandle {
    commands: mpsc::Sender<InstanceCommand>,
    task: JoinHandle<()>,
}

impl InstanceHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Owns every [`BridgeInstance`] task. Callers talk to instances only
/// through commands; process handles never leave their task.
pub struct Supervisor {
    ctx: InstanceContext,
    connectors: DashMap<ConnectorId, Connector>,
    instances: DashMap<ConnectorId, InstanceHandle>,
    command_queue_depth: usize,
    outbound_queue_capacity: usize,
}

impl Supervisor {
    pub fn new(ctx: InstanceContext, outbound_queue_capacity: usize) -> Self {
        let command_queue_depth = ctx.timing.command_queue_depth.max(1);
        Self {
            ctx,
            connectors: DashMap::new(),
            instances: DashMap::new(),
            command_queue_depth,
            outbound_queue_capacity: outbound_queue_capacity.max(1),
        }
    }

    /// Make a configured connector known, reported as `Stopped` until activated.
    pub fn register(&self, connector: Connector) {
        self.ctx.board.publish(initial_status(&connector, &self.ctx));
        self.connectors.insert(connector.id.clone(), connector);
    }

    pub fn connector(&self, connector_id: &ConnectorId) -> Option<Connector> {
        self.connectors.get(connector_id).map(|c| c.value().clone())
    }

    /// Ids of connectors whose failure at startup is fatal.
    pub fn required_connectors(&self) -> Vec<ConnectorId> {
        let mut ids: Vec<_> = self
            .connectors
            .iter()
            .filter(|c| c.required)
            .map(|c| c.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, connector_id: &ConnectorId) -> bool {
        self.instances
            .get(connector_id)
            .is_some_and(|handle| handle.is_running())
    }

    /// Spawn the supervising task for a registered connector.
    pub fn activate(&self, connector_id: &ConnectorId) -> Result<()> {
        let connector = self
            .connector(connector_id)
            .ok_or_else(|| not_configured(connector_id))?;

        match self.instances.entry(connector_id.clone()) {
            Entry::Occupied(entry) if entry.get().is_running() => Err(Error::Conflict(format!(
                "connector '{connector_id}' is already active"
            ))),
            entry => {
                let (commands, command_rx) = mpsc::channel(self.command_queue_depth);
                let (lane, lane_rx) = mpsc::channel(self.outbound_queue_capacity);
                self.ctx.lanes.insert(connector_id.clone(), lane);

                let instance = BridgeInstance::new(connector, self.ctx.clone(), command_rx, lane_rx);
                let task = tokio::spawn(instance.run());
                let handle = InstanceHandle { commands, task };
                match entry {
                    Entry::Occupied(mut entry) => {
                        entry.insert(handle);
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(handle);
                    }
                }
                info!(connector = %connector_id, "connector activated");
                Ok(())
            }
        }
    }

    /// Ask the instance to stop. Accepted once queued; the connector reports
    /// `Stopped` when its bridge is gone.
    pub fn deactivate(&self, connector_id: &ConnectorId) -> Result<()> {
        self.send_command(connector_id, InstanceCommand::Deactivate)
    }

    /// Ask the bridge to start pairing, now or as soon as it is ready.
    pub fn trigger_pair(&self, connector_id: &ConnectorId) -> Result<()> {
        self.send_command(connector_id, InstanceCommand::Pair)
    }

    /// Restart a connector with fresh failure counters. Brings a stopped
    /// connector back and releases a failed one.
    pub fn restart(&self, connector_id: &ConnectorId) -> Result<()> {
        if self.is_running(connector_id) {
            self.send_command(connector_id, InstanceCommand::Restart)
        } else {
            self.activate(connector_id)
        }
    }

    /// Wait until the connector is `Ready` or `Failed`, or is no longer running.
    pub async fn wait_settled(&self, connector_id: &ConnectorId) -> BridgeState {
        let mut updates = self.ctx.board.subscribe();
        loop {
            match self.ctx.board.state_of(connector_id) {
                Some(state @ (BridgeState::Ready | BridgeState::Failed)) => return state,
                None => return BridgeState::Stopped,
                Some(_) => {}
            }
            if !self.is_running(connector_id) {
                return BridgeState::Stopped;
            }
            // Re-check on every update, and periodically in case the task ended quietly.
            let _ = tokio::time::timeout(Duration::from_millis(250), updates.recv()).await;
        }
    }

    /// Deactivate every connector and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        let ids: Vec<_> = self.instances.iter().map(|e| e.key().clone()).collect();
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let Some((_, handle)) = self.instances.remove(&id) else {
                continue;
            };
            if handle.is_running() {
                let _ = handle.commands.send(InstanceCommand::Deactivate).await;
            }
            tasks.push((id, handle.task));
        }

        for (id, task) in tasks {
            if let Err(e) = task.await {
                warn!(connector = %id, error = %e, "supervisor task ended abnormally");
            }
        }
        info!("all connectors stopped");
    }

    fn send_command(&self, connector_id: &ConnectorId, command: InstanceCommand) -> Result<()> {
        if !self.connectors.contains_key(connector_id) {
            return Err(not_configured(connector_id));
        }
        let not_active = || Error::Conflict(format!("connector '{connector_id}' is not active"));
        let handle = self.instances.get(connector_id).ok_or_else(not_active)?;
        if !handle.is_running() {
            return Err(not_active());
        }

        match handle.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Supervisor(format!(
                "command queue for connector '{connector_id}' is full"
            ))),
            Err(TrySendError::Closed(_)) => Err(not_active()),
        }
    }
}

fn not_configured(connector_id: &ConnectorId) -> Error {
    Error::NotFound(format!("connector '{connector_id}' is not configured"))
}
