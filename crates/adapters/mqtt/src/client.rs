//! rumqttc client behind the bridge's MQTT ports.
//!
//! The event loop runs in its own task for the whole life of the client.
//! It keeps flushing publishes after the bridge stops reading inbound
//! traffic, so the final `offline` messages reach the broker before the
//! clean disconnect.
//!
//! Inbound events go out on an unbounded channel. The pump must never wait
//! on the bridge: the bridge may itself be waiting on the request queue
//! only this loop drains.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ryobi_gdo2mqtt_app::ports::{MqttEvent, MqttMessage, MqttPublisher, MqttSource};
use ryobi_gdo2mqtt_app::topics::PAYLOAD_OFFLINE;
use ryobi_gdo2mqtt_domain::error::BridgeError;

use crate::config::MqttConfig;
use crate::error::MqttError;

const REQUEST_CAPACITY: usize = 128;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to the broker.
///
/// Nothing touches the network until the spawned event loop polls, and
/// connection failures are retried there, so this cannot fail.
#[must_use]
pub fn connect(config: &MqttConfig) -> (MqttClient, MqttEvents) {
    let mapper = config.topic_mapper();
    let (client, eventloop) = AsyncClient::new(options(config), REQUEST_CAPACITY);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let closing = Arc::new(AtomicBool::new(false));

    let pump = EventPump {
        client: client.clone(),
        eventloop,
        events: events_tx,
        subscriptions: vec![mapper.command_subscription(), mapper.birth_topic()],
        reconnect_delay: config.reconnect_delay(),
        closing: closing.clone(),
    };
    tracing::info!(host = %config.host, port = config.port, "connecting to MQTT broker");
    let task = tokio::spawn(pump.run());

    (
        MqttClient {
            client,
            closing,
            task: Arc::new(Mutex::new(Some(task))),
        },
        MqttEvents { events: events_rx },
    )
}

/// Broker options: credentials, keep-alive and the retained `offline` last
/// will on the bridge status topic.
#[must_use]
pub fn options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);
    if let Some(user) = &config.user {
        let password = config
            .password
            .as_ref()
            .map(|password| password.expose_secret().to_string())
            .unwrap_or_default();
        options.set_credentials(user.as_str(), password);
    }
    options.set_last_will(LastWill::new(
        config.topic_mapper().bridge_status_topic(),
        PAYLOAD_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    options
}

/// Publishing half. Cheap to clone.
#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
    closing: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MqttPublisher for MqttClient {
    fn publish(
        &self,
        message: MqttMessage,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        async move {
            tracing::trace!(topic = %message.topic, retain = message.retain, "publish");
            self.client
                .publish(message.topic, QoS::AtLeastOnce, message.retain, message.payload)
                .await
                .map_err(MqttError::from)?;
            Ok(())
        }
    }

    fn disconnect(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
        async move {
            self.closing.store(true, Ordering::SeqCst);
            self.client.disconnect().await.map_err(MqttError::from)?;
            let task = self
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(task) = task
                && tokio::time::timeout(FLUSH_TIMEOUT, task).await.is_err()
            {
                tracing::warn!("MQTT event loop did not finish flushing");
            }
            tracing::info!("disconnected from MQTT broker");
            Ok(())
        }
    }
}

/// Inbound half: connection events and messages on the subscribed topics.
pub struct MqttEvents {
    events: mpsc::UnboundedReceiver<MqttEvent>,
}

impl MqttSource for MqttEvents {
    fn next_event(&mut self) -> impl Future<Output = Option<MqttEvent>> + Send {
        self.events.recv()
    }
}

/// What the pump does with one event loop notification.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Subscribe,
    Forward(MqttEvent),
    Finish,
    Skip,
}

fn classify(event: Event) -> Step {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => Step::Subscribe,
        Event::Incoming(Packet::Publish(publish)) => Step::Forward(MqttEvent::Message {
            topic: publish.topic,
            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
        }),
        Event::Outgoing(Outgoing::Disconnect) => Step::Finish,
        Event::Incoming(_) | Event::Outgoing(_) => Step::Skip,
    }
}

struct EventPump {
    client: AsyncClient,
    eventloop: EventLoop,
    events: mpsc::UnboundedSender<MqttEvent>,
    subscriptions: Vec<String>,
    reconnect_delay: Duration,
    closing: Arc<AtomicBool>,
}

impl EventPump {
    async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(event) => match classify(event) {
                    Step::Subscribe => {
                        self.subscribe();
                        self.forward(MqttEvent::Connected);
                    }
                    Step::Forward(event) => self.forward(event),
                    Step::Finish => break,
                    Step::Skip => {}
                },
                Err(_) if self.closing.load(Ordering::SeqCst) => break,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        retry_secs = self.reconnect_delay.as_secs(),
                        "MQTT connection error"
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
        tracing::debug!("MQTT event loop stopped");
    }

    fn subscribe(&self) {
        tracing::info!("connected to MQTT broker");
        for topic in &self.subscriptions {
            // try_subscribe: the request queue is drained by this very loop
            match self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => tracing::debug!(topic = %topic, "subscribed"),
                Err(err) => tracing::warn!(topic = %topic, error = %err, "subscribe failed"),
            }
        }
    }

    fn forward(&self, event: MqttEvent) {
        // the bridge may already have stopped reading; keep flushing anyway
        if self.events.send(event).is_err() {
            tracing::trace!("MQTT events receiver dropped");
        }
    }
}
