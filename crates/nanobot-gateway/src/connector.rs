use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use nanobot_bridge::SpawnRequest;
use nanobot_common::ConnectorId;
use nanobot_config::{AppConfig, ConnectorConfig, RestartPolicyConfig};

/// A configured connector: which bridge to run for it and how to restart it.
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: ConnectorId,
    pub connector_type: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub required: bool,
    pub restart: RestartPolicyConfig,
}

impl Connector {
    pub fn from_config(id: &str, config: &ConnectorConfig, restart: RestartPolicyConfig) -> Self {
        Self {
            id: ConnectorId::from_string(id),
            connector_type: config.connector_type.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
            required: config.required,
            restart,
        }
    }

    /// Every enabled connector in `config`, in id order.
    pub fn all_from(config: &AppConfig) -> Vec<Self> {
        config
            .enabled_connectors()
            .map(|(id, c)| Self::from_config(id, c, config.restart_policy_for(id)))
            .collect()
    }

    pub fn spawn_request(&self, heartbeat_interval: Duration) -> SpawnRequest {
        SpawnRequest {
            connector_id: self.id.clone(),
            connector_type: self.connector_type.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            heartbeat_interval,
        }
    }
}
