//! End-to-end scenarios for the whole bridge.
//!
//! Each test runs the real cloud session manager and the real bridge. The
//! vendor cloud is a scripted socket and the broker an in-memory recorder,
//! so no network is touched and time is paused.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ryobi_gdo2mqtt_adapter_cloud::codec::decode_device;
use ryobi_gdo2mqtt_adapter_cloud::transport::{Incoming, Snapshot};
use ryobi_gdo2mqtt_adapter_cloud::{CloudConfig, CloudError, Connection, Connector, SessionManager};
use ryobi_gdo2mqtt_app::bridge::{Bridge, BridgeConfig};
use ryobi_gdo2mqtt_app::ports::{MqttEvent, MqttMessage, MqttPublisher, MqttSource};
use ryobi_gdo2mqtt_app::topics::TopicMapper;
use ryobi_gdo2mqtt_domain::error::BridgeError;
use ryobi_gdo2mqtt_domain::id::DeviceId;
use ryobi_gdo2mqtt_domain::session::AuthToken;
use ryobi_gdo2mqtt_domain::time::now;

const OPENER: &str = "c4be84986d2e";
const LIGHT_ONLY: &str = "aabbccddeeff";

// ---------------------------------------------------------------------------
// Scripted cloud
// ---------------------------------------------------------------------------

struct FakeSocket {
    queued: VecDeque<Incoming>,
    peer: mpsc::UnboundedReceiver<Incoming>,
    sent: Arc<Mutex<Vec<Value>>>,
}

impl Connection for FakeSocket {
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), CloudError>> + Send {
        let request: Value = serde_json::from_str(&text).unwrap();
        let id = request["id"].clone();
        match request["method"].as_str() {
            Some("srvWebSocketAuth") => self.queued.push_back(Incoming::Text(
                json!({"jsonrpc": "2.0", "id": id, "result": {"authorized": true}}).to_string(),
            )),
            Some("gdoModuleCommand") => self.queued.push_back(Incoming::Text(
                json!({"jsonrpc": "2.0", "id": id, "result": {}}).to_string(),
            )),
            _ => {}
        }
        self.sent.lock().unwrap().push(request);
        async { Ok(()) }
    }

    fn ping(&mut self) -> impl Future<Output = Result<(), CloudError>> + Send {
        self.queued.push_back(Incoming::Pong);
        async { Ok(()) }
    }

    fn recv(&mut self) -> impl Future<Output = Option<Result<Incoming, CloudError>>> + Send {
        async move {
            if let Some(incoming) = self.queued.pop_front() {
                return Some(Ok(incoming));
            }
            self.peer.recv().await.map(Ok)
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        self.peer.close();
        async {}
    }
}

/// Test side of one socket: push notifications, drop to cut the link.
struct Peer {
    inbound: mpsc::UnboundedSender<Incoming>,
}

fn notification(params: Value) -> Incoming {
    let frame = json!({"jsonrpc": "2.0", "method": "wskAttributeUpdateNtfy", "params": params});
    Incoming::Text(frame.to_string())
}

impl Peer {
    fn notify(&self, params: Value) {
        self.inbound.send(notification(params)).unwrap();
    }
}

#[derive(Default)]
struct Script {
    snapshot: Snapshot,
    opens: VecDeque<Result<FakeSocket, CloudError>>,
    open_calls: usize,
    calls: Vec<&'static str>,
    /// Pushed on the socket while the next snapshot is being fetched.
    during_snapshot: Option<(mpsc::UnboundedSender<Incoming>, Incoming)>,
}

#[derive(Clone, Default)]
struct FakeCloud {
    script: Arc<Mutex<Script>>,
    sent: Arc<Mutex<Vec<Value>>>,
}

impl FakeCloud {
    fn socket(&self) -> (FakeSocket, Peer) {
        let (inbound, peer) = mpsc::unbounded_channel();
        let socket = FakeSocket {
            queued: VecDeque::new(),
            peer,
            sent: self.sent.clone(),
        };
        (socket, Peer { inbound })
    }

    fn push_socket(&self) -> Peer {
        let (socket, peer) = self.socket();
        self.script.lock().unwrap().opens.push_back(Ok(socket));
        peer
    }

    fn push_failure(&self, err: CloudError) {
        self.script.lock().unwrap().opens.push_back(Err(err));
    }

    fn set_snapshot(&self, snapshot: Snapshot) {
        self.script.lock().unwrap().snapshot = snapshot;
    }

    fn notify_during_snapshot(&self, peer: &Peer, params: Value) {
        self.script.lock().unwrap().during_snapshot =
            Some((peer.inbound.clone(), notification(params)));
    }

    fn open_calls(&self) -> usize {
        self.script.lock().unwrap().open_calls
    }

    fn calls(&self) -> Vec<&'static str> {
        self.script.lock().unwrap().calls.clone()
    }

    fn commands(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request["method"] == "gdoModuleCommand")
            .cloned()
            .collect()
    }
}

impl Connector for FakeCloud {
    type Connection = FakeSocket;

    fn login(&self) -> impl Future<Output = Result<AuthToken, CloudError>> + Send {
        std::future::ready(Ok(AuthToken::new("api-key", now())))
    }

    fn devices(&self) -> impl Future<Output = Result<Vec<DeviceId>, CloudError>> + Send {
        let mut script = self.script.lock().unwrap();
        script.calls.push("devices");
        let ids = script
            .snapshot
            .devices
            .iter()
            .map(|device| device.id.clone())
            .collect();
        std::future::ready(Ok(ids))
    }

    fn snapshot(
        &self,
        _devices: &[DeviceId],
    ) -> impl Future<Output = Result<Snapshot, CloudError>> + Send {
        let mut script = self.script.lock().unwrap();
        script.calls.push("snapshot");
        if let Some((peer, incoming)) = script.during_snapshot.take() {
            peer.send(incoming).unwrap();
        }
        std::future::ready(Ok(script.snapshot.clone()))
    }

    fn open(&self) -> impl Future<Output = Result<FakeSocket, CloudError>> + Send {
        let mut script = self.script.lock().unwrap();
        script.open_calls += 1;
        script.calls.push("open");
        let result = script
            .opens
            .pop_front()
            .unwrap_or_else(|| Err(CloudError::Protocol("no socket scripted".to_string())));
        std::future::ready(result)
    }
}

fn snapshot(light_on: bool) -> Snapshot {
    let opener = json!({
        "garageDoor_7": {"at": {"doorState": {"value": 0}, "sensorFlag": {"value": false}}},
        "backupCharger_8": {"at": {"chargeLevel": {"value": 80}}},
        "garageLight_9": {"at": {"lightState": {"value": light_on}}}
    });
    let light_only = json!({
        "garageLight_1": {"at": {"lightState": {"value": false}}}
    });
    let decode = |id: &str, name: &str, map: &Value| {
        decode_device(
            DeviceId::new(id).unwrap(),
            name,
            Some("gdoMasterUnit"),
            map.as_object().unwrap(),
            now(),
        )
        .unwrap()
    };
    Snapshot::from(vec![
        decode(OPENER, "Garage", &opener),
        decode(LIGHT_ONLY, "Shed", &light_only),
    ])
}

// ---------------------------------------------------------------------------
// In-memory broker
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct FakeBroker {
    published: Arc<Mutex<Vec<MqttMessage>>>,
}

impl FakeBroker {
    fn published(&self) -> Vec<MqttMessage> {
        self.published.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    fn payloads(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .map(|message| message.payload)
            .collect()
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
        async { Ok(()) }
    }
}

struct Inbox(mpsc::UnboundedReceiver<MqttEvent>);

impl MqttSource for Inbox {
    fn next_event(&mut self) -> impl Future<Output = Option<MqttEvent>> + Send {
        self.0.recv()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    cloud: FakeCloud,
    peer: Option<Peer>,
    broker: FakeBroker,
    mqtt: mpsc::UnboundedSender<MqttEvent>,
    shutdown: CancellationToken,
    bridge: tokio::task::JoinHandle<Result<(), BridgeError>>,
}

impl Harness {
    async fn start() -> Self {
        let cloud = FakeCloud::default();
        cloud.set_snapshot(snapshot(false));
        let peer = cloud.push_socket();
        let config = CloudConfig {
            email: "me@example.com".to_string(),
            ..CloudConfig::default()
        };
        let (session, frames) = SessionManager::new(cloud.clone(), config)
            .connect()
            .await
            .unwrap();

        let broker = FakeBroker::default();
        let (mqtt, inbox) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let bridge = Bridge::new(
            session,
            frames,
            broker.clone(),
            Inbox(inbox),
            TopicMapper::default(),
            BridgeConfig::default(),
        );
        let bridge = tokio::spawn(bridge.run(shutdown.clone()));

        let harness = Self {
            cloud,
            peer: Some(peer),
            broker,
            mqtt,
            shutdown,
            bridge,
        };
        harness
            .eventually(|broker| broker.payloads(&state(OPENER, "door")) == ["closed"])
            .await;
        harness.broker.clear();
        harness
    }

    fn peer(&self) -> &Peer {
        self.peer.as_ref().unwrap()
    }

    fn command(&self, device: &str, feature: &str, payload: &str) {
        self.mqtt
            .send(MqttEvent::Message {
                topic: format!("ryobi_gdo_2_mqtt/{device}/{feature}/set"),
                payload: payload.to_string(),
            })
            .unwrap();
    }

    async fn eventually(&self, condition: impl Fn(&FakeBroker) -> bool) {
        for _ in 0..3_000 {
            if condition(&self.broker) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met, published: {:#?}", self.broker.published());
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    async fn stop(self) -> FakeBroker {
        self.shutdown.cancel();
        self.bridge.await.unwrap().unwrap();
        self.broker
    }
}

fn state(device: &str, feature: &str) -> String {
    format!("ryobi_gdo_2_mqtt/{device}/{feature}/state")
}

fn availability(device: &str) -> String {
    format!("ryobi_gdo_2_mqtt/{device}/availability")
}

fn diagnostic(broker: &FakeBroker, device: &str) -> Option<Value> {
    broker
        .payloads(&format!("ryobi_gdo_2_mqtt/{device}/diagnostic"))
        .last()
        .map(|payload| serde_json::from_str(payload).unwrap())
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn should_publish_only_the_changed_door_state() {
    let harness = Harness::start().await;

    harness
        .peer()
        .notify(json!({"varName": OPENER, "garageDoor_7.doorState": {"value": 3}}));
    harness
        .eventually(|broker| broker.payloads(&state(OPENER, "door")) == ["opening"])
        .await;
    harness.settle().await;

    assert_eq!(harness.broker.payloads(&state(OPENER, "door")), ["opening"]);
    assert!(harness.broker.payloads(&state(OPENER, "battery")).is_empty());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn should_publish_a_repeated_delta_once() {
    let harness = Harness::start().await;

    for _ in 0..2 {
        harness
            .peer()
            .notify(json!({"varName": OPENER, "garageLight_9.lightState": {"value": true}}));
    }
    harness
        .eventually(|broker| !broker.payloads(&state(OPENER, "light")).is_empty())
        .await;
    harness.settle().await;

    assert_eq!(harness.broker.payloads(&state(OPENER, "light")), ["ON"]);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn should_relay_open_command_and_resolve_acknowledged() {
    let harness = Harness::start().await;

    harness.command(OPENER, "door", "OPEN");
    harness
        .eventually(|broker| {
            diagnostic(broker, OPENER).is_some_and(|report| report["outcome"] == "acknowledged")
        })
        .await;

    let commands = harness.cloud.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["params"]["moduleType"], 5);
    assert_eq!(commands[0]["params"]["portId"], 7);
    assert_eq!(commands[0]["params"]["moduleMsg"], json!({"doorCommand": 1}));
    assert_eq!(commands[0]["params"]["topic"], OPENER);
    let report = diagnostic(&harness.broker, OPENER).unwrap();
    assert_eq!(report["feature"], "door");
    assert_eq!(report["value"], "OPEN");
    assert_eq!(harness.broker.payloads(&state(OPENER, "door")), ["opening"]);

    let broker = harness.stop().await;
    assert_eq!(broker.payloads(&availability(OPENER)).last().unwrap(), "offline");
    assert_eq!(
        broker.payloads("ryobi_gdo_2_mqtt/status").last().unwrap(),
        "offline"
    );
}

#[tokio::test(start_paused = true)]
async fn should_refuse_open_for_device_without_door() {
    let harness = Harness::start().await;

    harness.command(LIGHT_ONLY, "door", "OPEN");
    harness
        .eventually(|broker| diagnostic(broker, LIGHT_ONLY).is_some())
        .await;

    let report = diagnostic(&harness.broker, LIGHT_ONLY).unwrap();
    assert_eq!(report["outcome"], "unsupported_feature");
    assert!(harness.cloud.commands().is_empty());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn should_resync_after_reconnecting_on_third_attempt() {
    let mut harness = Harness::start().await;

    // the light was switched on while the link was down
    harness.cloud.set_snapshot(snapshot(true));
    harness
        .cloud
        .push_failure(CloudError::Protocol("connection reset".to_string()));
    harness.cloud.push_failure(CloudError::Timeout("connect"));
    let _replacement = harness.cloud.push_socket();
    drop(harness.peer.take());

    harness
        .eventually(|broker| broker.payloads(&state(OPENER, "light")) == ["ON"])
        .await;
    harness.settle().await;

    assert_eq!(harness.cloud.open_calls(), 4);
    assert_eq!(harness.broker.payloads(&availability(OPENER)), ["offline", "online"]);
    assert_eq!(
        harness.broker.payloads(&availability(LIGHT_ONLY)),
        ["offline", "online"]
    );
    assert!(harness.broker.payloads(&state(OPENER, "door")).is_empty());
    assert!(harness.broker.payloads(&state(OPENER, "battery")).is_empty());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn should_keep_a_change_made_while_the_resync_snapshot_is_fetched() {
    let mut harness = Harness::start().await;

    // the snapshot still shows the door closed, the socket already saw it opening
    let replacement = harness.cloud.push_socket();
    harness.cloud.notify_during_snapshot(
        &replacement,
        json!({"varName": OPENER, "garageDoor_7.doorState": {"value": 3}}),
    );
    drop(harness.peer.take());

    harness
        .eventually(|broker| broker.payloads(&state(OPENER, "door")) == ["opening"])
        .await;
    harness.settle().await;

    assert_eq!(harness.broker.payloads(&state(OPENER, "door")), ["opening"]);
    assert_eq!(
        harness.cloud.calls()[3..],
        ["devices", "open", "snapshot"]
    );
    harness.stop().await;
}
