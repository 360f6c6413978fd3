//! Configuration loading: TOML file with environment variable overrides.
//!
//! Looks for `ryobi_gdo_2_mqtt.toml` in the working directory, or the file
//! named by `RYOBI_CONFIG_FILE`. Every field has a default so the file is
//! optional. Environment variables take precedence over file values.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use ryobi_gdo2mqtt_adapter_cloud::CloudConfig;
use ryobi_gdo2mqtt_adapter_mqtt::MqttConfig;
use ryobi_gdo2mqtt_app::bridge::BridgeConfig;
use ryobi_gdo2mqtt_app::dispatcher::DispatcherConfig;
use ryobi_gdo2mqtt_app::reconciler::ReconcilerConfig;

const DEFAULT_FILE: &str = "ryobi_gdo_2_mqtt.toml";
const BRIDGE_CRATES: [&str; 2] = ["ryobi_gdo_2_mqtt", "ryobi_gdo2mqtt"];
const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Vendor cloud account and session tuning.
    pub cloud: CloudConfig,
    /// MQTT broker settings.
    pub mqtt: MqttConfig,
    /// Command and device lifecycle tuning.
    pub bridge: BridgeSettings,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// `[bridge]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// How long a command may stay unacknowledged, in seconds.
    pub ack_timeout_secs: u64,
    /// How long after sending a matching state change still counts as an
    /// acknowledgment, in seconds.
    pub ack_match_window_secs: u64,
    /// Consecutive snapshot omissions before a device is marked offline.
    pub offline_after_misses: u32,
    /// Consecutive snapshot omissions before a device is forgotten.
    pub forget_after_misses: u32,
    /// How long shutdown waits for in-flight commands, in seconds.
    pub shutdown_grace_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax) or a bare level.
    pub filter: String,
}

impl Config {
    /// Load configuration from the config file (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// cloud credentials are missing.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RYOBI_CONFIG_FILE").unwrap_or_else(|_| DEFAULT_FILE.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("RYOBI_EMAIL") {
            self.cloud.email = val;
        }
        if let Some(val) = var("RYOBI_PASSWORD") {
            self.cloud.password = SecretString::from(val);
        }
        if let Some(val) = var("RYOBI_DEVICES") {
            self.cloud.devices = val
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(val) = var("RYOBI_MQTT_HOST") {
            self.mqtt.host = val;
        }
        if let Some(val) = var("RYOBI_MQTT_PORT")
            && let Ok(port) = val.parse()
        {
            self.mqtt.port = port;
        }
        if let Some(val) = var("RYOBI_MQTT_USER") {
            self.mqtt.user = Some(val).filter(|user| !user.is_empty());
        }
        if let Some(val) = var("RYOBI_MQTT_PASSWORD") {
            self.mqtt.password = Some(SecretString::from(val));
        }
        if let Some(val) = var("RYOBI_LOG_LEVEL") {
            self.logging.filter = val;
        }
        if let Some(val) = var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cloud.email.trim().is_empty() {
            return Err(ConfigError::Validation(
                "cloud email is required (RYOBI_EMAIL)".to_string(),
            ));
        }
        if self.cloud.password.expose_secret().is_empty() {
            return Err(ConfigError::Validation(
                "cloud password is required (RYOBI_PASSWORD)".to_string(),
            ));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::Validation("MQTT port must be non-zero".to_string()));
        }
        if self.cloud.reconnect_initial_secs == 0 {
            return Err(ConfigError::Validation(
                "cloud reconnect_initial_secs must be non-zero".to_string(),
            ));
        }
        if self.bridge.ack_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "bridge ack_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.bridge.forget_after_misses < self.bridge.offline_after_misses {
            return Err(ConfigError::Validation(
                "forget_after_misses must not be lower than offline_after_misses".to_string(),
            ));
        }
        Ok(())
    }

    /// Log filter directive. A bare level applies to the bridge crates.
    #[must_use]
    pub fn log_filter(&self) -> String {
        let filter = self.logging.filter.trim();
        let level = filter.to_ascii_lowercase();
        if LEVELS.contains(&level.as_str()) {
            BRIDGE_CRATES
                .iter()
                .map(|name| format!("{name}={level}"))
                .collect::<Vec<_>>()
                .join(",")
        } else {
            filter.to_string()
        }
    }
}

impl BridgeSettings {
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            reconciler: ReconcilerConfig {
                offline_after_misses: self.offline_after_misses,
                forget_after_misses: self.forget_after_misses,
            },
            dispatcher: DispatcherConfig {
                ack_timeout: Duration::from_secs(self.ack_timeout_secs),
                match_window: Duration::from_secs(self.ack_match_window_secs),
            },
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..BridgeConfig::default()
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 10,
            ack_match_window_secs: 10,
            offline_after_misses: 2,
            forget_after_misses: 5,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "ryobi_gdo_2_mqtt=info,ryobi_gdo2mqtt=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn with_credentials() -> Config {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[
            ("RYOBI_EMAIL", "me@example.com"),
            ("RYOBI_PASSWORD", "secret"),
        ]));
        config
    }

    #[test]
    fn should_produce_sensible_defaults() {
        let config = Config::default();
        assert_eq!(config.cloud.host, "tti.tiwiconnect.com");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.bridge.ack_timeout_secs, 10);
        assert_eq!(config.logging.filter, "ryobi_gdo_2_mqtt=info,ryobi_gdo2mqtt=info");
    }

    #[test]
    fn should_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mqtt.base_topic, "ryobi_gdo_2_mqtt");
    }

    #[test]
    fn should_parse_full_toml() {
        let toml = "
            [cloud]
            email = 'me@example.com'
            password = 'secret'
            devices = ['c4be84986d2e']
            heartbeat_interval_secs = 15

            [mqtt]
            host = 'broker.lan'
            user = 'bridge'

            [bridge]
            ack_timeout_secs = 20
            forget_after_misses = 10

            [logging]
            filter = 'debug'
        ";
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cloud.email, "me@example.com");
        assert_eq!(config.cloud.devices, vec!["c4be84986d2e".to_string()]);
        assert_eq!(config.cloud.heartbeat_interval_secs, 15);
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.user.as_deref(), Some("bridge"));
        assert_eq!(config.bridge.ack_timeout_secs, 20);
        assert_eq!(config.bridge.offline_after_misses, 2);
        assert_eq!(config.logging.filter, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_return_default_when_file_not_found() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn should_report_parse_error_for_invalid_toml() {
        let result: Result<Config, _> = toml::from_str("invalid {{{");
        assert!(result.is_err());
    }

    #[test]
    fn should_apply_environment_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[
            ("RYOBI_EMAIL", "me@example.com"),
            ("RYOBI_PASSWORD", "secret"),
            ("RYOBI_DEVICES", "aaa, bbb,,"),
            ("RYOBI_MQTT_HOST", "10.0.0.2"),
            ("RYOBI_MQTT_PORT", "1884"),
            ("RYOBI_MQTT_USER", "bridge"),
            ("RYOBI_MQTT_PASSWORD", "mqtt-secret"),
        ]));
        assert_eq!(config.cloud.email, "me@example.com");
        assert_eq!(config.cloud.password.expose_secret(), "secret");
        assert_eq!(config.cloud.devices, vec!["aaa".to_string(), "bbb".to_string()]);
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.user.as_deref(), Some("bridge"));
        assert_eq!(
            config.mqtt.password.as_ref().map(ExposeSecret::expose_secret),
            Some("mqtt-secret")
        );
    }

    #[test]
    fn should_ignore_unparsable_port_override() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("RYOBI_MQTT_PORT", "not-a-port")]));
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn should_prefer_rust_log_over_log_level() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[
            ("RYOBI_LOG_LEVEL", "DEBUG"),
            ("RUST_LOG", "rumqttc=trace"),
        ]));
        assert_eq!(config.log_filter(), "rumqttc=trace");
    }

    #[test]
    fn should_expand_bare_level_to_bridge_crates() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("RYOBI_LOG_LEVEL", "DEBUG")]));
        assert_eq!(
            config.log_filter(),
            "ryobi_gdo_2_mqtt=debug,ryobi_gdo2mqtt=debug"
        );
    }

    #[test]
    fn should_reject_missing_email() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn should_reject_missing_password() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[("RYOBI_EMAIL", "me@example.com")]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn should_accept_credentials() {
        assert!(with_credentials().validate().is_ok());
    }

    #[test]
    fn should_reject_forget_threshold_below_offline_threshold() {
        let mut config = with_credentials();
        config.bridge.forget_after_misses = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_reject_zero_reconnect_delay() {
        let mut config = with_credentials();
        config.cloud.reconnect_initial_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconnect_initial_secs"));
    }

    #[test]
    fn should_reject_zero_ack_timeout() {
        let mut config = with_credentials();
        config.bridge.ack_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ack_timeout_secs"));
    }

    #[test]
    fn should_convert_bridge_settings() {
        let settings = BridgeSettings {
            ack_timeout_secs: 7,
            shutdown_grace_secs: 3,
            ..BridgeSettings::default()
        };
        let config = settings.bridge_config();
        assert_eq!(config.dispatcher.ack_timeout, Duration::from_secs(7));
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
        assert_eq!(config.reconciler.forget_after_misses, 5);
    }

    #[test]
    fn should_not_print_passwords_in_debug_output() {
        let config = with_credentials();
        assert!(!format!("{config:?}").contains("secret"));
    }
}
