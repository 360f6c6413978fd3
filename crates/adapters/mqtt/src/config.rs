//! MQTT broker configuration.

use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use ryobi_gdo2mqtt_app::topics::{DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX, TopicMapper};

/// Configuration for the MQTT broker connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address.
    pub host: String,
    /// MQTT broker port.
    pub port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    /// Optional broker username.
    pub user: Option<String>,
    /// Broker password, only used together with `user`.
    pub password: Option<SecretString>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Pause after a broker connection error before polling again, in seconds.
    pub reconnect_delay_secs: u64,
    /// Prefix of every state, command and availability topic.
    pub base_topic: String,
    /// Home Assistant discovery prefix.
    pub discovery_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "ryobi_gdo_2_mqtt".to_string(),
            user: None,
            password: None,
            keep_alive_secs: 30,
            reconnect_delay_secs: 5,
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
        }
    }
}

impl MqttConfig {
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        // rumqttc rejects keep-alives under five seconds
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Topic layout for these prefixes.
    #[must_use]
    pub fn topic_mapper(&self) -> TopicMapper {
        TopicMapper::new(self.base_topic.as_str(), self.discovery_prefix.as_str())
    }
}
