use nanobot_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest frame limit we accept; below this a handshake would not fit.
const MIN_FRAME_BYTES: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Default restart policy, overridable per connector.
    #[serde(default)]
    pub restart: RestartPolicyConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    /// Connectors keyed by connector id. Ordered so startup is deterministic.
    #[serde(default)]
    pub connectors: BTreeMap<String, ConnectorConfig>,

    /// Where sessions and the restart ledger live. Defaults to the config directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            supervisor: SupervisorConfig::default(),
            restart: RestartPolicyConfig::default(),
            router: RouterConfig::default(),
            channel: ChannelConfig::default(),
            connectors: BTreeMap::new(),
            data_dir: None,
            log_level: Some("info".to_string()),
        }
    }
}

impl AppConfig {
    /// Restart policy for a connector: its own override, else the global default.
    pub fn restart_policy_for(&self, connector_id: &str) -> RestartPolicyConfig {
        self.connectors
            .get(connector_id)
            .and_then(|c| c.restart.clone())
            .unwrap_or_else(|| self.restart.clone())
    }

    /// Connectors that are not explicitly disabled.
    pub fn enabled_connectors(&self) -> impl Iterator<Item = (&String, &ConnectorConfig)> {
        self.connectors
            .iter()
            .filter(|(_, c)| c.enabled.unwrap_or(true))
    }

    /// Reject combinations that would make the supervisor or router misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            return Err(Error::Config("gateway.port cannot be 0".into()));
        }

        self.supervisor.validate()?;
        self.restart.validate("restart")?;
        self.router.validate()?;
        self.channel.validate()?;

        for (id, connector) in &self.connectors {
            if id.trim().is_empty() {
                return Err(Error::Config("connector id cannot be empty".into()));
            }
            if connector.connector_type.trim().is_empty() {
                return Err(Error::Config(format!(
                    "connectors.{id}.type cannot be empty"
                )));
            }
            if connector.command.trim().is_empty() {
                return Err(Error::Config(format!(
                    "connectors.{id}.command cannot be empty"
                )));
            }
            if let Some(policy) = &connector.restart {
                policy.validate(&format!("connectors.{id}.restart"))?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// When set, every route except `/health` requires this key.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18790
}

/// Heartbeat and lifecycle timing shared by every bridge instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,

    /// How long a sent envelope may wait for the bridge's delivery receipt.
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            command_queue_depth: default_command_queue_depth(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "supervisor.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(Error::Config(format!(
                "supervisor.heartbeat_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "supervisor.poll_interval_ms must be positive".into(),
            ));
        }
        if self.command_queue_depth == 0 {
            return Err(Error::Config(
                "supervisor.command_queue_depth must be positive".into(),
            ));
        }
        if self.delivery_timeout_secs == 0 {
            return Err(Error::Config(
                "supervisor.delivery_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_heartbeat_timeout_secs() -> u64 {
    15
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_command_queue_depth() -> usize {
    32
}

fn default_delivery_timeout_secs() -> u64 {
    60
}

/// Exponential backoff restart policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Continuous `Ready` time after which the delay drops back to base.
    #[serde(default = "default_reset_after_secs")]
    pub reset_after_secs: u64,

    /// Consecutive starts that may fail to reach `Ready` before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            reset_after_secs: default_reset_after_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RestartPolicyConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_secs(self.reset_after_secs)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(Error::Config(format!(
                "{section}.base_delay_ms must be positive"
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(format!(
                "{section}.max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(format!(
                "{section}.max_attempts must be at least 1"
            )));
        }
        Ok(())
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_reset_after_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Maximum span of sequence numbers held while waiting for a gap to fill.
    #[serde(default = "default_reorder_window")]
    pub reorder_window: u64,

    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,

    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            reorder_window: default_reorder_window(),
            gap_timeout_ms: default_gap_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            ack_timeout_ms: default_ack_timeout_ms(),
            inbox_capacity: default_inbox_capacity(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl RouterConfig {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.reorder_window == 0 {
            return Err(Error::Config("router.reorder_window must be positive".into()));
        }
        for (name, value) in [
            ("outbound_queue_capacity", self.outbound_queue_capacity),
            ("inbox_capacity", self.inbox_capacity),
            ("event_queue_capacity", self.event_queue_capacity),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("router.{name} must be positive")));
            }
        }
        Ok(())
    }
}

fn default_reorder_window() -> u64 {
    64
}

fn default_gap_timeout_ms() -> u64 {
    2000
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_inbox_capacity() -> usize {
    1024
}

fn default_event_queue_capacity() -> usize {
    1024
}

/// Limits for the framed channel between the gateway and each bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ChannelConfig {
    fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::Config("channel.queue_depth must be positive".into()));
        }
        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(Error::Config(format!(
                "channel.max_frame_bytes must be at least {MIN_FRAME_BYTES}"
            )));
        }
        Ok(())
    }
}

fn default_queue_depth() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    256 * 1024
}

/// One messaging integration backed by a bridge executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub connector_type: String,

    /// Bridge executable, resolved through `PATH` when not absolute.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// A required connector that reaches `Failed` during startup aborts the gateway.
    #[serde(default)]
    pub required: bool,

    pub enabled: Option<bool>,

    #[serde(default)]
    pub restart: Option<RestartPolicyConfig>,
}
