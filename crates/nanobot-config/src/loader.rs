use std::path::{Path, PathBuf};

use nanobot_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

const CONFIG_DIR_ENV: &str = "NANOBOT_CONFIG_DIR";

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        let config_dir = Self::default_config_dir();
        Ok(Self { config_dir })
    }

    /// `$NANOBOT_CONFIG_DIR`, else `~/.nanobot`, else `./.nanobot`.
    pub fn default_config_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .map(|h| h.join(".nanobot"))
            .unwrap_or_else(|| PathBuf::from(".nanobot"))
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Directory holding sessions and the restart ledger.
    pub fn data_dir(&self, config: &AppConfig) -> PathBuf {
        config
            .data_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.clone())
    }

    /// Returns true if a config file (YAML, TOML or JSON) exists on disk.
    pub fn config_file_exists(&self) -> bool {
        ["config.yml", "config.toml", "config.json"]
            .iter()
            .any(|name| self.config_dir.join(name).exists())
    }

    /// Load and validate the config. YAML wins over TOML, TOML over JSON.
    pub fn load(&self) -> Result<AppConfig> {
        let config = self.load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    fn load_unvalidated(&self) -> Result<AppConfig> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");
        let json_path = self.config_dir.join("config.json");

        if yaml_path.exists() {
            info!("loading config from {}", yaml_path.display());
            let contents = std::fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))
        } else if toml_path.exists() {
            info!("loading config from {}", toml_path.display());
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))
        } else if json_path.exists() {
            info!("loading config from {}", json_path.display());
            let contents = std::fs::read_to_string(&json_path)?;
            serde_json::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse JSON config: {e}")))
        } else {
            info!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }

    pub fn ensure_dirs(&self, config: &AppConfig) -> Result<()> {
        let data_dir = self.data_dir(config);
        let dirs = [
            self.config_dir.clone(),
            data_dir.join("sessions"),
            data_dir.join("supervisor"),
        ];

        for dir in &dirs {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigLoader;
    use crate::model::AppConfig;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "nanobot-config-test-{}-{}-{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn load_returns_default_when_no_config_exists() {
        let dir = temp_dir("default");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.gateway.host, "0.0.0.0");
        assert_eq!(config.gateway.port, 18790);
        assert!(config.connectors.is_empty());
        assert!(!loader.config_file_exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_prefers_yaml_over_toml_when_both_exist() {
        let dir = temp_dir("yaml-precedence");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.yml"),
            "gateway:\n  host: \"127.0.0.1\"\n  port: 4001\n",
        )
        .expect("failed to write yaml config");
        fs::write(
            dir.join("config.toml"),
            "[gateway]\nhost = \"127.0.0.2\"\nport = 4999\n",
        )
        .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 4001);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reads_connectors_from_toml() {
        let dir = temp_dir("toml");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.toml"),
            r#"
[gateway]
port = 4002

[connectors.wa1]
type = "whatsapp"
command = "node"
args = ["bridge/dist/index.js"]
required = true

[connectors.wa1.restart]
max_attempts = 3
"#,
        )
        .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        let wa1 = config.connectors.get("wa1").expect("wa1 configured");
        assert_eq!(wa1.connector_type, "whatsapp");
        assert_eq!(wa1.args, vec!["bridge/dist/index.js".to_string()]);
        assert!(wa1.required);
        assert_eq!(config.restart_policy_for("wa1").max_attempts, 3);
        assert_eq!(config.restart_policy_for("wa1").base_delay_ms, 1000);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reads_json_when_yaml_and_toml_missing() {
        let dir = temp_dir("json");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.json"),
            r#"{"gateway": {"port": 4003}, "router": {"reorder_window": 8}}"#,
        )
        .expect("failed to write json config");

        let config = ConfigLoader::with_dir(&dir).load().expect("load should succeed");
        assert_eq!(config.gateway.port, 4003);
        assert_eq!(config.router.reorder_window, 8);
        assert_eq!(config.router.inbox_capacity, 1024);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = temp_dir("invalid");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.yml"),
            "supervisor:\n  heartbeat_interval_secs: 10\n  heartbeat_timeout_secs: 5\n",
        )
        .expect("failed to write yaml config");

        let err = ConfigLoader::with_dir(&dir).load().unwrap_err();
        assert!(err.to_string().contains("configuration error"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn ensure_dirs_creates_expected_subdirectories() {
        let dir = temp_dir("ensure-dirs");
        let loader = ConfigLoader::with_dir(&dir);

        loader
            .ensure_dirs(&AppConfig::default())
            .expect("ensure_dirs should succeed");

        assert!(dir.exists());
        assert!(dir.join("sessions").exists());
        assert!(dir.join("supervisor").exists());

        let _ = fs::remove_dir_all(dir);
    }
}
