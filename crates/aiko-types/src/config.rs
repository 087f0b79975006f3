//! Process configuration resolved from the environment.
//!
//! `AIKO_MQTT_HOST` (default `localhost`), `AIKO_MQTT_PORT` (default 1883,
//! or 8883 when `AIKO_MQTT_TLS=true`), `AIKO_NAMESPACE` (default `aiko`),
//! `AIKO_LOG_LEVEL` and `AIKO_LOG_MQTT` (`all` | `true` | `false`).

use std::env;

pub const ENV_MQTT_HOST: &str = "AIKO_MQTT_HOST";
pub const ENV_MQTT_PORT: &str = "AIKO_MQTT_PORT";
pub const ENV_MQTT_TLS: &str = "AIKO_MQTT_TLS";
pub const ENV_NAMESPACE: &str = "AIKO_NAMESPACE";
pub const ENV_LOG_LEVEL: &str = "AIKO_LOG_LEVEL";
pub const ENV_LOG_MQTT: &str = "AIKO_LOG_MQTT";

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_TLS_PORT: u16 = 8883;

// ── Log destination ───────────────────────────────────────────────────────────

/// Where log records go: the console, the bus `log` topic, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogDestination {
    #[default]
    All,
    Bus,
    Console,
}

impl LogDestination {
    fn from_env_value(value: &str) -> Self {
        match value {
            "true" => Self::Bus,
            "false" => Self::Console,
            _ => Self::All,
        }
    }

    pub fn to_console(self) -> bool {
        matches!(self, Self::All | Self::Console)
    }

    pub fn to_bus(self) -> bool {
        matches!(self, Self::All | Self::Bus)
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_tls: bool,
    pub log_level: Option<String>,
    pub log_destination: LogDestination,
}

impl Config {
    pub fn from_env() -> Self {
        let mqtt_tls = env::var(ENV_MQTT_TLS)
            .map(|v| v == "true")
            .unwrap_or(false);
        let default_port = if mqtt_tls {
            DEFAULT_MQTT_TLS_PORT
        } else {
            DEFAULT_MQTT_PORT
        };
        let mqtt_port = env::var(ENV_MQTT_PORT)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_port);

        Self {
            namespace: env::var(ENV_NAMESPACE).unwrap_or_else(|_| "aiko".into()),
            mqtt_host: env::var(ENV_MQTT_HOST).unwrap_or_else(|_| "localhost".into()),
            mqtt_port,
            mqtt_tls,
            log_level: env::var(ENV_LOG_LEVEL).ok(),
            log_destination: env::var(ENV_LOG_MQTT)
                .map(|v| LogDestination::from_env_value(&v))
                .unwrap_or_default(),
        }
    }

    /// Well-known retained topic carrying the primary Registrar address.
    pub fn registrar_topic(&self) -> String {
        format!("{}/service/registrar", self.namespace)
    }

    /// Wildcard subscription matching every service's liveness topic.
    pub fn service_state_pattern(&self) -> String {
        format!("{}/+/+/+/state", self.namespace)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "aiko".into(),
            mqtt_host: "localhost".into(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_tls: false,
            log_level: None,
            log_destination: LogDestination::default(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
