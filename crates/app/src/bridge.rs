//! Bridge orchestrator: runs the two flows and owns shutdown.
//!
//! ```text
//! cloud-inbound:  FrameSource ─▶ Reconciler ─▶ Projector ─▶ MqttPublisher
//! mqtt-inbound:   MqttSource  ─▶ CommandDispatcher ─▶ CloudSession
//! sweeper:        PendingTable timeouts ─▶ diagnostics
//! ```
//!
//! Each flow blocks only on its own source. Shutdown stops the MQTT flow
//! first, lets in-flight commands settle for a grace period, then stops the
//! cloud flow, closes the session and takes every topic offline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ryobi_gdo2mqtt_domain::error::BridgeError;

use crate::dispatcher::{CommandDispatcher, DispatcherConfig, PendingTable};
use crate::ports::{CloudSession, FrameSource, MqttEvent, MqttMessage, MqttPublisher, MqttSource, SessionEvent};
use crate::projection::Projector;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::state::{BridgeState, SharedState, lock};
use crate::topics::{PAYLOAD_ONLINE, TopicMapper};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Tunables of the synchronization engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub reconciler: ReconcilerConfig,
    pub dispatcher: DispatcherConfig,
    /// How long shutdown waits for in-flight commands.
    pub shutdown_grace: Duration,
    /// How often overdue commands are swept.
    pub sweep_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            shutdown_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Wires the cloud session and the MQTT client together.
pub struct Bridge<C, F, P, M> {
    dispatcher: Arc<CommandDispatcher<C>>,
    state: SharedState,
    frames: F,
    publisher: P,
    mqtt: M,
    birth_topic: String,
    config: BridgeConfig,
}

impl<C, F, P, M> Bridge<C, F, P, M>
where
    C: CloudSession + 'static,
    F: FrameSource + 'static,
    P: MqttPublisher + Clone + 'static,
    M: MqttSource + 'static,
{
    pub fn new(
        session: C,
        frames: F,
        publisher: P,
        mqtt: M,
        mapper: TopicMapper,
        config: BridgeConfig,
    ) -> Self {
        let state = BridgeState::new(
            Reconciler::new(config.reconciler),
            PendingTable::new(config.dispatcher),
            Projector::new(mapper.clone()),
        )
        .into_shared();
        let birth_topic = mapper.birth_topic();
        Self {
            dispatcher: Arc::new(CommandDispatcher::new(session, state.clone(), mapper)),
            state,
            frames,
            publisher,
            mqtt,
            birth_topic,
            config,
        }
    }

    /// Handle on the shared state, for inspection.
    #[must_use]
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Run until `shutdown` fires or the cloud session ends.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Auth`] when the cloud refused to
    /// re-authenticate. Transient failures never end the bridge.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        let Self {
            dispatcher,
            state,
            frames,
            publisher,
            mqtt,
            birth_topic,
            config,
        } = self;

        let commands_stop = CancellationToken::new();
        let cloud_stop = CancellationToken::new();

        let mut cloud_task = tokio::spawn(cloud_inbound(
            frames,
            state.clone(),
            publisher.clone(),
            cloud_stop.clone(),
        ));
        let mqtt_task = tokio::spawn(mqtt_inbound(
            mqtt,
            dispatcher.clone(),
            state.clone(),
            publisher.clone(),
            birth_topic,
            commands_stop.clone(),
        ));
        let sweeper = tokio::spawn(sweep(
            state.clone(),
            publisher.clone(),
            config.sweep_interval,
            cloud_stop.clone(),
        ));
        tracing::info!("bridge running");

        let finished = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!("shutdown requested");
                None
            }
            result = &mut cloud_task => Some(result),
        };

        dispatcher.stop_accepting();
        commands_stop.cancel();
        if let Err(err) = mqtt_task.await {
            tracing::warn!(error = %err, "mqtt flow ended abnormally");
        }

        let cloud_result = match finished {
            Some(result) => result,
            None => {
                drain(&state, config.shutdown_grace).await;
                cloud_stop.cancel();
                cloud_task.await
            }
        };
        cloud_stop.cancel();
        if let Err(err) = sweeper.await {
            tracing::warn!(error = %err, "sweeper ended abnormally");
        }

        dispatcher.close_session().await;
        let messages = lock(&state).shutdown();
        publish_all(&publisher, messages).await;
        if let Err(err) = publisher.disconnect().await {
            tracing::warn!(error = %err, "mqtt disconnect failed");
        }
        tracing::info!("bridge stopped");

        cloud_result.map_err(BridgeError::network)?
    }
}

async fn cloud_inbound<F, P>(
    mut frames: F,
    state: SharedState,
    publisher: P,
    stop: CancellationToken,
) -> Result<(), BridgeError>
where
    F: FrameSource,
    P: MqttPublisher,
{
    loop {
        let event = tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            event = frames.next_event() => event,
        };
        let messages = match event {
            None => {
                tracing::info!("cloud session ended");
                return Ok(());
            }
            Some(SessionEvent::Frame(frame)) => lock(&state).on_frame(&frame, Instant::now()),
            Some(SessionEvent::StateChanged(session)) => {
                tracing::debug!(state = %session, "cloud session state changed");
                lock(&state).on_session_state(session)
            }
            Some(SessionEvent::Fatal(err)) => {
                tracing::error!(error = %err, "cloud refused authentication");
                return Err(err.into());
            }
        };
        publish_all(&publisher, messages).await;
    }
}

async fn mqtt_inbound<C, M, P>(
    mut mqtt: M,
    dispatcher: Arc<CommandDispatcher<C>>,
    state: SharedState,
    publisher: P,
    birth_topic: String,
    stop: CancellationToken,
) where
    C: CloudSession,
    M: MqttSource,
    P: MqttPublisher,
{
    loop {
        let event = tokio::select! {
            biased;
            () = stop.cancelled() => return,
            event = mqtt.next_event() => event,
        };
        let messages = match event {
            None => {
                tracing::info!("mqtt client stopped");
                return;
            }
            Some(MqttEvent::Connected) => lock(&state).announce_online(),
            Some(MqttEvent::Message { topic, payload }) if topic == birth_topic => {
                if payload.trim() != PAYLOAD_ONLINE {
                    continue;
                }
                tracing::info!("home assistant online, republishing discovery");
                lock(&state).republish()
            }
            Some(MqttEvent::Message { topic, payload }) => {
                match dispatcher.handle_command(&topic, &payload).await {
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(topic = %topic, error = %err, "command refused");
                        lock(&state)
                            .refusal(&topic, &payload, &err)
                            .into_iter()
                            .collect()
                    }
                }
            }
        };
        publish_all(&publisher, messages).await;
    }
}

async fn sweep<P: MqttPublisher>(
    state: SharedState,
    publisher: P,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let messages = lock(&state).expire_commands(Instant::now());
        publish_all(&publisher, messages).await;
    }
}

async fn drain(state: &SharedState, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        let in_flight = lock(state).pending.len();
        if in_flight == 0 {
            return;
        }
        if Instant::now() >= deadline {
            tracing::warn!(in_flight, "grace period over with commands still in flight");
            return;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

async fn publish_all<P: MqttPublisher>(publisher: &P, messages: Vec<MqttMessage>) {
    for message in messages {
        let topic = message.topic.clone();
        if let Err(err) = publisher.publish(message).await {
            tracing::warn!(topic = %topic, error = %err, "publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use ryobi_gdo2mqtt_domain::command::OutboundCommand;
    use ryobi_gdo2mqtt_domain::device::Device;
    use ryobi_gdo2mqtt_domain::error::AuthError;
    use ryobi_gdo2mqtt_domain::feature::{DoorState, DoorStatus, Feature};
    use ryobi_gdo2mqtt_domain::frame::CloudFrame;
    use ryobi_gdo2mqtt_domain::id::DeviceId;

    #[derive(Default)]
    struct FakeSession {
        sent: Mutex<Vec<OutboundCommand>>,
        closed: Mutex<bool>,
    }

    impl CloudSession for FakeSession {
        fn send(
            &self,
            command: OutboundCommand,
        ) -> impl Future<Output = Result<(), BridgeError>> + Send {
            self.sent.lock().unwrap().push(command);
            async { Ok(()) }
        }

        fn close(&self) -> impl Future<Output = ()> + Send {
            *self.closed.lock().unwrap() = true;
            async {}
        }
    }

    struct ChannelSource<T>(mpsc::UnboundedReceiver<T>);

    impl FrameSource for ChannelSource<SessionEvent> {
        fn next_event(&mut self) -> impl Future<Output = Option<SessionEvent>> + Send {
            self.0.recv()
        }
    }

    impl MqttSource for ChannelSource<MqttEvent> {
        fn next_event(&mut self) -> impl Future<Output = Option<MqttEvent>> + Send {
            self.0.recv()
        }
    }

    #[derive(Clone, Default)]
    struct FakeBroker {
        published: Arc<Mutex<Vec<MqttMessage>>>,
        disconnected: Arc<Mutex<bool>>,
    }

    impl FakeBroker {
        fn take(&self) -> Vec<MqttMessage> {
            std::mem::take(&mut *self.published.lock().unwrap())
        }
    }

    impl MqttPublisher for FakeBroker {
        fn publish(
            &self,
            message: MqttMessage,
        ) -> impl Future<Output = Result<(), BridgeError>> + Send {
            self.published.lock().unwrap().push(message);
            async { Ok(()) }
        }

        fn disconnect(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
            *self.disconnected.lock().unwrap() = true;
            async { Ok(()) }
        }
    }

    fn snapshot() -> SessionEvent {
        SessionEvent::Frame(CloudFrame::Snapshot(vec![
            Device::builder()
                .id(DeviceId::new("gdo1").unwrap())
                .name("Garage")
                .feature(Feature::Door(DoorStatus {
                    state: DoorState::Closed,
                    obstructed: false,
                }))
                .build()
                .unwrap(),
        ]))
    }

    struct Harness {
        cloud: mpsc::UnboundedSender<SessionEvent>,
        mqtt: mpsc::UnboundedSender<MqttEvent>,
        session: Arc<FakeSession>,
        broker: FakeBroker,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<Result<(), BridgeError>>,
    }

    fn start() -> Harness {
        let (cloud, cloud_rx) = mpsc::unbounded_channel();
        let (mqtt, mqtt_rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeSession::default());
        let broker = FakeBroker::default();
        let shutdown = CancellationToken::new();
        let bridge = Bridge::new(
            session.clone(),
            ChannelSource(cloud_rx),
            broker.clone(),
            ChannelSource(mqtt_rx),
            TopicMapper::default(),
            BridgeConfig::default(),
        );
        let handle = tokio::spawn(bridge.run(shutdown.clone()));
        Harness {
            cloud,
            mqtt,
            session,
            broker,
            shutdown,
            handle,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_relay_command_and_shut_down_cleanly() {
        let harness = start();
        harness.cloud.send(snapshot()).unwrap();
        settle().await;

        harness
            .mqtt
            .send(MqttEvent::Message {
                topic: "ryobi_gdo_2_mqtt/gdo1/door/set".to_string(),
                payload: "OPEN".to_string(),
            })
            .unwrap();
        settle().await;
        assert_eq!(harness.session.sent.lock().unwrap().len(), 1);

        harness.shutdown.cancel();
        harness.handle.await.unwrap().unwrap();

        assert!(*harness.session.closed.lock().unwrap());
        assert!(*harness.broker.disconnected.lock().unwrap());
        let published = harness.broker.take();
        assert_eq!(
            published.last().unwrap(),
            &MqttMessage::retained("ryobi_gdo_2_mqtt/status", "offline")
        );
        assert!(published.contains(&MqttMessage::retained(
            "ryobi_gdo_2_mqtt/gdo1/availability",
            "offline"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_unacknowledged_command() {
        let harness = start();
        harness.cloud.send(snapshot()).unwrap();
        settle().await;
        harness
            .mqtt
            .send(MqttEvent::Message {
                topic: "ryobi_gdo_2_mqtt/gdo1/door/set".to_string(),
                payload: "CLOSE".to_string(),
            })
            .unwrap();
        settle().await;
        harness.broker.take();

        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        let published = harness.broker.take();
        assert!(
            published
                .iter()
                .any(|m| m.topic == "ryobi_gdo_2_mqtt/gdo1/diagnostic"
                    && m.payload.contains("timed_out"))
        );
        harness.shutdown.cancel();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_republish_discovery_on_home_assistant_birth() {
        let harness = start();
        harness.cloud.send(snapshot()).unwrap();
        settle().await;
        harness.broker.take();

        harness
            .mqtt
            .send(MqttEvent::Message {
                topic: "homeassistant/status".to_string(),
                payload: "online".to_string(),
            })
            .unwrap();
        settle().await;

        let published = harness.broker.take();
        assert!(
            published
                .iter()
                .any(|m| m.topic == "homeassistant/cover/gdo1/door/config")
        );
        harness.shutdown.cancel();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_on_fatal_authentication_error() {
        let harness = start();
        harness
            .cloud
            .send(SessionEvent::Fatal(AuthError {
                reason: "password changed".to_string(),
            }))
            .unwrap();

        let result = harness.handle.await.unwrap();

        assert!(matches!(result, Err(BridgeError::Auth(_))));
        assert!(*harness.broker.disconnected.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn should_publish_diagnostic_for_refused_command() {
        let harness = start();
        harness.cloud.send(snapshot()).unwrap();
        settle().await;
        harness.broker.take();

        harness
            .mqtt
            .send(MqttEvent::Message {
                topic: "ryobi_gdo_2_mqtt/gdo1/light/set".to_string(),
                payload: "ON".to_string(),
            })
            .unwrap();
        settle().await;

        let published = harness.broker.take();
        assert_eq!(published.len(), 1);
        assert!(published[0].payload.contains("unsupported_feature"));
        assert!(harness.session.sent.lock().unwrap().is_empty());
        harness.shutdown.cancel();
        harness.handle.await.unwrap().unwrap();
    }
}
