use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::settings::Settings;

/// Everything one connect attempt needs. Built fresh from the current
/// settings for every attempt, so env updates take effect on reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub use_tls: bool,
}

impl ConnectParams {
    /// The auth token doubles as the MQTT username; the password stays empty.
    pub fn new(settings: &Settings, tuning: &MqttTuning, client_id: String) -> Self {
        Self {
            client_id,
            host: settings.mqtt_host.clone(),
            port: settings.mqtt_port,
            username: settings.auth_token.clone(),
            password: String::new(),
            keep_alive: settings.keep_alive(),
            use_tls: tuning.tls,
        }
    }
}

/// Transport options and timeouts of the connectivity layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttTuning {
    /// Connect over TLS with the platform's root certificates
    pub tls: bool,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub disconnect_linger_ms: u64,
}

impl Default for MqttTuning {
    fn default() -> Self {
        Self {
            tls: false,
            connect_timeout_ms: 12_000,
            operation_timeout_ms: 5_000,
            disconnect_linger_ms: 250,
        }
    }
}

impl MqttTuning {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn disconnect_linger(&self) -> Duration {
        Duration::from_millis(self.disconnect_linger_ms)
    }
}
