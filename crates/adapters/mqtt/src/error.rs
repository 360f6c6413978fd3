//! MQTT adapter error types.

use ryobi_gdo2mqtt_domain::error::BridgeError;

/// Errors specific to the MQTT adapter.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// The request queue to the event loop is closed or full.
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),

    /// The connection to the broker failed.
    #[error("MQTT connection error")]
    Connection(#[source] Box<rumqttc::ConnectionError>),
}

impl MqttError {
    /// Convert into a [`BridgeError::Network`] for propagation across port
    /// boundaries.
    #[must_use]
    pub fn into_domain(self) -> BridgeError {
        BridgeError::network(self)
    }
}

impl From<MqttError> for BridgeError {
    fn from(err: MqttError) -> Self {
        err.into_domain()
    }
}

impl From<rumqttc::ClientError> for MqttError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Client(err)
    }
}

impl From<rumqttc::ConnectionError> for MqttError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        Self::Connection(Box::new(err))
    }
}
