//! Cloud session configuration.

use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::error::CloudError;

/// Vendor cloud host serving both the REST API and the WebSocket endpoint.
pub const DEFAULT_HOST: &str = "tti.tiwiconnect.com";

/// Configuration for the vendor cloud session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Account e-mail, also the `varName` sent when authorizing the socket.
    pub email: String,
    /// Account password. Only ever sent to the login endpoint.
    pub password: SecretString,
    /// Cloud hostname.
    pub host: String,
    /// Vendor device ids to bridge. Empty means every device on the account.
    pub devices: Vec<String>,
    /// Timeout for each REST request, in seconds.
    pub request_timeout_secs: u64,
    /// Deadline for the socket authorization reply, in seconds.
    pub auth_timeout_secs: u64,
    /// Interval between heartbeat pings, in seconds.
    pub heartbeat_interval_secs: u64,
    /// How long a ping may stay unanswered, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// First reconnect delay, in seconds.
    pub reconnect_initial_secs: u64,
    /// Upper bound on the reconnect delay, in seconds.
    pub reconnect_max_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: SecretString::from(String::new()),
            host: DEFAULT_HOST.to_string(),
            devices: Vec::new(),
            request_timeout_secs: 10,
            auth_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            reconnect_initial_secs: 1,
            reconnect_max_secs: 60,
        }
    }
}

impl CloudConfig {
    /// Base URL of the REST API.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::InvalidUrl`] when `host` is not a valid host.
    pub fn rest_url(&self) -> Result<Url, CloudError> {
        Url::parse(&format!("https://{}/", self.host)).map_err(CloudError::InvalidUrl)
    }

    /// URL of the WebSocket JSON-RPC endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::InvalidUrl`] when `host` is not a valid host.
    pub fn websocket_url(&self) -> Result<Url, CloudError> {
        Url::parse(&format!("wss://{}/api/wsrpc", self.host)).map_err(CloudError::InvalidUrl)
    }

    /// Whether `device_id` passes the allowlist.
    #[must_use]
    pub fn is_bridged(&self, device_id: &str) -> bool {
        self.devices.is_empty() || self.devices.iter().any(|id| id == device_id)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }

    #[must_use]
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs.max(1))
    }

    #[must_use]
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn should_have_sensible_defaults() {
        let config = CloudConfig::default();
        assert_eq!(config.host, "tti.tiwiconnect.com");
        assert!(config.devices.is_empty());
        assert_eq!(config.auth_timeout_secs, 10);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.reconnect_max_secs, 60);
    }

    #[test]
    fn should_never_hand_out_a_zero_reconnect_delay() {
        let config = CloudConfig {
            reconnect_initial_secs: 0,
            ..CloudConfig::default()
        };
        assert_eq!(config.reconnect_initial(), Duration::from_secs(1));
    }

    #[test]
    fn should_deserialize_from_toml() {
        let toml = r#"
            email = "me@example.com"
            password = "hunter2"
            devices = ["c4be84986d2e"]
            heartbeat_timeout_secs = 5
        "#;
        let config: CloudConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.email, "me@example.com");
        assert_eq!(config.password.expose_secret(), "hunter2");
        assert_eq!(config.devices, vec!["c4be84986d2e".to_string()]);
        assert_eq!(config.heartbeat_timeout_secs, 5);
        assert_eq!(config.reconnect_initial_secs, 1);
    }

    #[test]
    fn should_build_endpoint_urls() {
        let config = CloudConfig::default();
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://tti.tiwiconnect.com/api/wsrpc"
        );
        assert_eq!(
            config.rest_url().unwrap().join("api/login").unwrap().as_str(),
            "https://tti.tiwiconnect.com/api/login"
        );
    }

    #[test]
    fn should_bridge_everything_without_allowlist() {
        let mut config = CloudConfig::default();
        assert!(config.is_bridged("abc"));
        config.devices = vec!["def".to_string()];
        assert!(!config.is_bridged("abc"));
        assert!(config.is_bridged("def"));
    }

    #[test]
    fn should_not_leak_password_in_debug_output() {
        let config = CloudConfig {
            password: SecretString::from("hunter2".to_string()),
            ..CloudConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
