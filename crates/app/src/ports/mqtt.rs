//! MQTT port: publish and receive on the broker.

use std::future::Future;

use ryobi_gdo2mqtt_domain::error::BridgeError;

/// One outgoing MQTT publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl MqttMessage {
    /// A retained message.
    #[must_use]
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }

    /// A non-retained message.
    #[must_use]
    pub fn transient(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Something received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    /// The client (re)connected and its subscriptions are in place.
    Connected,
    /// A message on one of the subscribed topics.
    Message { topic: String, payload: String },
}

/// Publishes messages to the broker.
pub trait MqttPublisher: Send + Sync {
    fn publish(&self, message: MqttMessage)
    -> impl Future<Output = Result<(), BridgeError>> + Send;

    /// Disconnect cleanly so the broker does not fire the last will.
    fn disconnect(&self) -> impl Future<Output = Result<(), BridgeError>> + Send;
}

impl<T: MqttPublisher> MqttPublisher for std::sync::Arc<T> {
    fn publish(
        &self,
        message: MqttMessage,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        (**self).publish(message)
    }

    fn disconnect(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
        (**self).disconnect()
    }
}

/// Receives broker traffic for the subscribed topics.
pub trait MqttSource: Send {
    /// Wait for the next event. `None` once the client has shut down.
    fn next_event(&mut self) -> impl Future<Output = Option<MqttEvent>> + Send;
}
