//! Local client configuration (`client.toml`).
//!
//! This is the operator's file: where the server-issued env and schema live,
//! how fast the main cycle ticks and how the unit restarts after an update.
//! Runtime settings issued by the server stay in the env JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PepeunitError, Result};
use crate::mqtt::MqttTuning;
use crate::update::RestartMode;

const CONFIG_DIR: &str = "pepeunit";
const CONFIG_FILE: &str = "client.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub env_path: PathBuf,
    pub schema_path: PathBuf,
    /// NDJSON unit log; `None` keeps the log in `tracing` only
    pub log_path: Option<PathBuf>,
    /// Receives the extracted update archive when set
    pub program_dir: Option<PathBuf>,
    pub cycle_speed_ms: u64,
    pub restart_mode: RestartMode,
    pub console_log: bool,
    pub mqtt: MqttTuning,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            env_path: PathBuf::from("env.json"),
            schema_path: PathBuf::from("schema.json"),
            log_path: Some(PathBuf::from("log.json")),
            program_dir: None,
            cycle_speed_ms: 100,
            restart_mode: RestartMode::default(),
            console_log: true,
            mqtt: MqttTuning::default(),
        }
    }
}

impl ClientConfig {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_speed_ms.max(1))
    }

    /// `<config dir>/pepeunit/client.toml`, or the working directory when the
    /// platform has no config dir.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Reads `path`; a missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| PepeunitError::io(path, e))?;
        if !exists {
            debug!("Config file {:?} does not exist, using default", path);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PepeunitError::io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| PepeunitError::Config(format!("{}: {}", path.display(), e)))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PepeunitError::Config(format!("Failed to serialize config: {e}")))?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PepeunitError::io(dir, e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| PepeunitError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(&dir.path().join("client.toml")).await.unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.cycle_period(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        tokio::fs::write(
            &path,
            "restart_mode = \"restart_popen\"\nprogram_dir = \"/opt/unit\"\n\n[mqtt]\ntls = true\n",
        )
        .await
        .unwrap();

        let config = ClientConfig::load(&path).await.unwrap();
        assert_eq!(config.restart_mode, RestartMode::RestartViaNewProcess);
        assert_eq!(config.program_dir, Some(PathBuf::from("/opt/unit")));
        assert!(config.mqtt.tls);
        assert_eq!(config.mqtt.operation_timeout_ms, MqttTuning::default().operation_timeout_ms);
        assert_eq!(config.env_path, PathBuf::from("env.json"));
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/client.toml");
        let config = ClientConfig {
            restart_mode: RestartMode::NoRestart,
            cycle_speed_ms: 250,
            ..ClientConfig::default()
        };
        config.save(&path).await.unwrap();
        assert_eq!(ClientConfig::load(&path).await.unwrap(), config);
    }

    #[tokio::test]
    async fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        tokio::fs::write(&path, "cycle_speed_ms = \"fast\"").await.unwrap();
        assert!(matches!(
            ClientConfig::load(&path).await,
            Err(PepeunitError::Config(_))
        ));
    }
}
