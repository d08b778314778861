//! Runtime settings issued by the server as an env JSON document.
//!
//! The file is owned by the server: it is replaced wholesale on env updates and
//! re-read afterwards. Keys this client does not model are kept in `extras` so
//! user code can read its own values (e.g. a publish delay) from the same file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{PepeunitError, Result};
use crate::files;
use crate::logger::LogLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "PU_DOMAIN")]
    pub domain: String,
    #[serde(rename = "PU_APP_PREFIX")]
    pub app_prefix: String,
    #[serde(rename = "PU_API_ACTUAL_PREFIX")]
    pub api_actual_prefix: String,
    #[serde(rename = "PU_HTTP_TYPE")]
    pub http_type: String,
    #[serde(rename = "PU_MQTT_HOST")]
    pub mqtt_host: String,
    #[serde(rename = "PU_MQTT_PORT", deserialize_with = "lenient_port")]
    pub mqtt_port: u16,
    #[serde(rename = "PU_AUTH_TOKEN")]
    pub auth_token: String,
    #[serde(rename = "PU_SECRET_KEY")]
    pub secret_key: String,
    #[serde(rename = "PU_ENCRYPT_KEY")]
    pub encrypt_key: String,
    #[serde(rename = "PU_COMMIT_VERSION")]
    pub commit_version: String,
    /// Keep-alive interval in seconds
    #[serde(rename = "PU_MQTT_PING_INTERVAL", deserialize_with = "lenient_u64")]
    pub mqtt_ping_interval: u64,
    /// Seconds between two state snapshots on `state/pepeunit`
    #[serde(rename = "PU_STATE_SEND_INTERVAL", deserialize_with = "lenient_u64")]
    pub state_send_interval: u64,
    #[serde(rename = "PU_MIN_LOG_LEVEL", alias = "MINIMAL_LOG_LEVEL")]
    pub min_log_level: LogLevel,
    /// Maximum number of lines kept in the log file
    #[serde(rename = "PU_MAX_LOG_LENGTH", deserialize_with = "lenient_u64")]
    pub max_log_length: u64,
    #[serde(flatten)]
    pub extras: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            domain: String::new(),
            app_prefix: String::new(),
            api_actual_prefix: String::new(),
            http_type: "https".to_string(),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            auth_token: String::new(),
            secret_key: String::new(),
            encrypt_key: String::new(),
            commit_version: String::new(),
            mqtt_ping_interval: 30,
            state_send_interval: 300,
            min_log_level: LogLevel::Debug,
            max_log_length: 64,
            extras: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt_ping_interval.max(1))
    }

    pub fn state_send_interval(&self) -> Duration {
        Duration::from_secs(self.state_send_interval)
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    /// Reads an extra key as an integer, accepting numbers and numeric strings.
    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        match self.extras.get(key)? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extras.get(key).and_then(Value::as_str)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientInt {
    Int(u64),
    Float(f64),
    Text(String),
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match LenientInt::deserialize(deserializer)? {
        LenientInt::Int(v) => Ok(v),
        LenientInt::Float(v) if v >= 0.0 => Ok(v as u64),
        LenientInt::Float(v) => Err(de::Error::custom(format!("negative value {v}"))),
        LenientInt::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

fn lenient_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    let raw = lenient_u64(deserializer)?;
    u16::try_from(raw).map_err(|_| de::Error::custom(format!("port out of range: {raw}")))
}

/// File-backed settings provider with snapshot reads.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Arc<Settings>>,
}

impl SettingsStore {
    /// Loads the env file; a missing file yields the defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = Self::read(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(settings)),
        })
    }

    pub fn from_settings(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(settings)),
        }
    }

    fn read(path: &Path) -> Result<Settings> {
        if !path.exists() {
            debug!("Env file {:?} missing, using defaults", path);
            return Ok(Settings::default());
        }
        let value = files::read_json_value(path)?;
        serde_json::from_value(value).map_err(|e| PepeunitError::Settings(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn swap(&self, settings: Settings) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(settings);
    }

    /// Re-reads the env file from disk.
    pub fn reload(&self) -> Result<()> {
        let settings = Self::read(&self.path)?;
        self.swap(settings);
        info!("Settings reloaded from {:?}", self.path);
        Ok(())
    }

    /// Persists `settings` to the env file and makes them current.
    pub fn save(&self, settings: Settings) -> Result<()> {
        files::write_json(&self.path, &settings)?;
        self.swap(settings);
        Ok(())
    }

    /// Replaces the env file with `new_env` and reloads.
    pub fn update_env_file(&self, new_env: &Path) -> Result<()> {
        files::copy_file(new_env, &self.path)?;
        self.reload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("env.json")).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.mqtt_port, 1883);
        assert_eq!(settings.state_send_interval, 300);
        assert_eq!(settings.http_type, "https");
    }

    #[test]
    fn numeric_strings_and_extras_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.json");
        files::write_json(
            &path,
            &json!({
                "PU_DOMAIN": "unit.example.com",
                "PU_MQTT_PORT": "8883",
                "PU_STATE_SEND_INTERVAL": 60.0,
                "MINIMAL_LOG_LEVEL": "Warning",
                "DELAY_PUB_MSG": "15"
            }),
        )
        .unwrap();

        let store = SettingsStore::load(&path).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.domain, "unit.example.com");
        assert_eq!(settings.mqtt_port, 8883);
        assert_eq!(settings.state_send_interval, 60);
        assert_eq!(settings.min_log_level, LogLevel::Warning);
        assert_eq!(settings.extra_u64("DELAY_PUB_MSG"), Some(15));
    }

    #[test]
    fn update_env_file_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("env.json");
        let fresh = dir.path().join("downloaded.json");
        files::write_json(&live, &json!({"PU_COMMIT_VERSION": "old"})).unwrap();
        files::write_json(&fresh, &json!({"PU_COMMIT_VERSION": "new"})).unwrap();

        let store = SettingsStore::load(&live).unwrap();
        let before = store.snapshot();
        store.update_env_file(&fresh).unwrap();

        assert_eq!(before.commit_version, "old");
        assert_eq!(store.snapshot().commit_version, "new");
    }
}
