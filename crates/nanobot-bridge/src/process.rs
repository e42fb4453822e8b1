use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nanobot_common::{ConnectorId, Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::protocol::BRIDGE_PROTOCOL_VERSION;

/// Everything needed to launch one bridge.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub connector_id: ConnectorId,
    pub connector_type: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub heartbeat_interval: Duration,
}

/// A launched bridge: its byte stream plus a handle on its lifetime.
pub struct SpawnedBridge {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub child: Box<dyn BridgeChild>,
}

/// Handle on a running bridge. Owned exclusively by its supervisor task.
#[async_trait]
pub trait BridgeChild: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for the bridge to exit and describe how it ended. Cancel-safe.
    async fn wait(&mut self) -> Result<String>;

    /// Terminate the bridge immediately.
    async fn kill(&mut self) -> Result<()>;
}

/// Launches bridges. The production implementation runs an executable; tests
/// substitute in-memory bridges.
#[async_trait]
pub trait BridgeSpawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedBridge>;
}

/// Spawns bridge executables and talks to them over stdin/stdout.
#[derive(Debug, Default, Clone)]
pub struct CommandSpawner;

#[async_trait]
impl BridgeSpawner for CommandSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedBridge> {
        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .envs(&request.env)
            .env("NANOBOT_CONNECTOR_ID", request.connector_id.as_str())
            .env("NANOBOT_CONNECTOR_TYPE", &request.connector_type)
            .env("NANOBOT_BRIDGE_PROTOCOL", BRIDGE_PROTOCOL_VERSION.to_string())
            .env(
                "NANOBOT_HEARTBEAT_INTERVAL_SECS",
                request.heartbeat_interval.as_secs().to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Bridge(format!(
                "failed to spawn bridge '{}' for connector '{}': {e}",
                request.command, request.connector_id
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Bridge("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Bridge("failed to capture bridge stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let connector = request.connector_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(connector = %connector, "bridge: {line}");
                }
            });
        }

        info!(
            connector = %request.connector_id,
            pid = ?child.id(),
            command = %request.command,
            "spawned bridge process"
        );

        Ok(SpawnedBridge {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Box::new(ProcessChild { child }),
        })
    }
}

struct ProcessChild {
    child: Child,
}

#[async_trait]
impl BridgeChild for ProcessChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<String> {
        let status = self.child.wait().await?;
        Ok(status.to_string())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, args: &[&str]) -> SpawnRequest {
        SpawnRequest {
            connector_id: ConnectorId::from_string("wa1"),
            connector_type: "whatsapp".into(),
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_fails() {
        let result = CommandSpawner
            .spawn(&request("nonexistent_bridge_xyz_42", &[]))
            .await;
        let err = result.err().expect("spawn should fail");
        assert!(err.to_string().contains("failed to spawn bridge"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_bridge_can_be_killed() {
        let mut bridge = CommandSpawner
            .spawn(&request("cat", &[]))
            .await
            .expect("cat should spawn");
        assert!(bridge.child.id().is_some());

        bridge.child.kill().await.expect("kill should succeed");
        let exit = bridge.child.wait().await.expect("wait should succeed");
        assert!(!exit.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bridge_sees_connector_environment() {
        use tokio::io::AsyncReadExt;

        let mut bridge = CommandSpawner
            .spawn(&request("sh", &["-c", "printf %s \"$NANOBOT_CONNECTOR_ID\""]))
            .await
            .expect("sh should spawn");

        let mut out = String::new();
        bridge.reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "wa1");
        bridge.child.wait().await.unwrap();
    }
}
