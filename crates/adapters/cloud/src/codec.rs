//! Vendor wire format.
//!
//! The socket speaks JSON-RPC 2.0. Requests carry a numeric `id`, replies
//! echo it, and attribute changes arrive as `wskAttributeUpdateNtfy`
//! notifications whose params are keyed `<module>_<port>.<attribute>`:
//!
//! ```json
//! {"jsonrpc":"2.0","method":"wskAttributeUpdateNtfy",
//!  "params":{"varName":"c4be84986d2e","garageDoor_7.doorState":{"value":3}}}
//! ```
//!
//! The REST device detail carries the same modules under `deviceTypeMap`,
//! each with an `at` map of `{value}` attributes. Everything is decoded into
//! domain types here. Unknown modules and attributes never get further.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::{Map, Value, json};

use ryobi_gdo2mqtt_domain::command::{Command, DoorCommand, OutboundCommand};
use ryobi_gdo2mqtt_domain::device::{Device, Health};
use ryobi_gdo2mqtt_domain::feature::{
    DEFAULT_FAN_MAX_SPEED, DoorState, DoorStatus, FanSpeed, Feature, FeatureUpdate,
};
use ryobi_gdo2mqtt_domain::frame::DeviceDelta;
use ryobi_gdo2mqtt_domain::id::DeviceId;
use ryobi_gdo2mqtt_domain::time::Timestamp;

use crate::error::CloudError;

const AUTH_METHOD: &str = "srvWebSocketAuth";
const SUBSCRIBE_METHOD: &str = "wskSubscribe";
const COMMAND_METHOD: &str = "gdoModuleCommand";
const NOTIFY_METHOD: &str = "wskAttributeUpdateNtfy";
const COMMAND_MSG_TYPE: u8 = 16;
const HIGHEST_DOOR_CODE: i64 = 4;

/// Hardware module of an opener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Module {
    GarageDoor,
    GarageLight,
    BackupCharger,
    WifiModule,
    ParkAssistLaser,
    Inflator,
    BtSpeaker,
    Fan,
}

impl Module {
    pub const ALL: [Self; 8] = [
        Self::GarageDoor,
        Self::GarageLight,
        Self::BackupCharger,
        Self::WifiModule,
        Self::ParkAssistLaser,
        Self::Inflator,
        Self::BtSpeaker,
        Self::Fan,
    ];

    #[must_use]
    pub fn vendor_name(self) -> &'static str {
        match self {
            Self::GarageDoor => "garageDoor",
            Self::GarageLight => "garageLight",
            Self::BackupCharger => "backupCharger",
            Self::WifiModule => "wifiModule",
            Self::ParkAssistLaser => "parkAssistLaser",
            Self::Inflator => "inflator",
            Self::BtSpeaker => "btSpeaker",
            Self::Fan => "fan",
        }
    }

    /// `moduleType` of command frames addressed to this module.
    #[must_use]
    pub fn module_type(self) -> u8 {
        match self {
            Self::GarageDoor | Self::GarageLight => 5,
            Self::BackupCharger => 6,
            Self::WifiModule => 7,
            Self::ParkAssistLaser => 1,
            Self::Inflator => 4,
            Self::BtSpeaker => 2,
            Self::Fan => 3,
        }
    }

    /// Split a module key such as `garageDoor_7` into module and port.
    #[must_use]
    pub fn parse_key(key: &str) -> Option<(Self, u32)> {
        let (name, port) = key.split_once('_')?;
        let module = Self::ALL
            .into_iter()
            .find(|module| module.vendor_name() == name)?;
        Some((module, port.parse().ok()?))
    }
}

/// Port of each module installed on one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceModules(BTreeMap<Module, u32>);

impl DeviceModules {
    /// Record a module. Returns `false` if it was already listed.
    pub fn insert(&mut self, module: Module, port: u32) -> bool {
        if self.0.contains_key(&module) {
            return false;
        }
        self.0.insert(module, port);
        true
    }

    #[must_use]
    pub fn port(&self, module: Module) -> Option<u32> {
        self.0.get(&module).copied()
    }
}

/// Module ports of every bridged device, refreshed with each snapshot.
#[derive(Debug, Clone, Default)]
pub struct ModuleIndex(HashMap<DeviceId, DeviceModules>);

impl ModuleIndex {
    pub fn insert(&mut self, device_id: DeviceId, modules: DeviceModules) {
        self.0.insert(device_id, modules);
    }

    #[must_use]
    pub fn port(&self, device_id: &DeviceId, module: Module) -> Option<u32> {
        self.0.get(device_id)?.port(module)
    }
}

/// Authorize the socket with the API key from the REST login.
#[must_use]
pub fn auth_request(id: u64, email: &str, api_key: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": AUTH_METHOD,
        "params": {"varName": email, "apiKey": api_key},
    })
    .to_string()
}

/// Ask for attribute notifications of one device.
#[must_use]
pub fn subscribe_request(id: u64, device_id: &DeviceId) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": SUBSCRIBE_METHOD,
        "params": {"topic": format!("{device_id}.{NOTIFY_METHOD}")},
    })
    .to_string()
}

/// Encode a validated command as a `gdoModuleCommand` request.
///
/// # Errors
///
/// Returns [`CloudError::Protocol`] when the device has no module able to
/// carry the command.
pub fn command_request(
    id: u64,
    command: &OutboundCommand,
    modules: &ModuleIndex,
) -> Result<String, CloudError> {
    let (module, message) = module_message(command.command);
    let port = modules.port(&command.device_id, module).ok_or_else(|| {
        CloudError::Protocol(format!(
            "device {} has no {} module",
            command.device_id,
            module.vendor_name()
        ))
    })?;
    Ok(json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": COMMAND_METHOD,
        "params": {
            "msgType": COMMAND_MSG_TYPE,
            "moduleType": module.module_type(),
            "portId": port,
            "moduleMsg": message,
            "topic": command.device_id.as_str(),
        },
    })
    .to_string())
}

fn module_message(command: Command) -> (Module, Value) {
    match command {
        Command::Door(door) => {
            let code = match door {
                DoorCommand::Close => 0,
                DoorCommand::Open => 1,
                DoorCommand::Stop => 2,
            };
            (Module::GarageDoor, json!({"doorCommand": code}))
        }
        Command::Light(on) => (Module::GarageLight, json!({"lightState": on})),
        Command::VacationMode(on) => (Module::GarageDoor, json!({"vacationMode": u8::from(on)})),
        Command::ParkAssist(on) => (Module::ParkAssistLaser, json!({"moduleState": on})),
        Command::Inflator(on) => (Module::Inflator, json!({"moduleState": on})),
        Command::Speaker(on) => (Module::BtSpeaker, json!({"moduleState": on})),
        Command::Fan(speed) => (Module::Fan, json!({"speed": speed})),
    }
}

/// One decoded socket message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Attribute changes of one device.
    Notification(DeviceDelta),
    /// Reply to one of our requests.
    Reply {
        id: u64,
        /// `Ok(result)` or `Err(error)` as sent by the cloud.
        outcome: Result<Value, Value>,
    },
    /// Valid JSON-RPC we have no use for.
    Ignored,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Map<String, Value>>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Decode one text frame from the socket.
///
/// # Errors
///
/// Returns [`CloudError::Decode`] for anything that is not a JSON-RPC
/// object and [`CloudError::Protocol`] for a notification without a valid
/// device id.
pub fn decode_inbound(text: &str, received_at: Timestamp) -> Result<Inbound, CloudError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(CloudError::Decode)?;

    if let Some(method) = envelope.method.as_deref() {
        if method != NOTIFY_METHOD {
            tracing::trace!(method, "ignoring cloud request");
            return Ok(Inbound::Ignored);
        }
        let params = envelope.params.unwrap_or_default();
        return decode_notification(&params, received_at);
    }

    let Some(id) = envelope.id.as_ref().and_then(Value::as_u64) else {
        return Ok(Inbound::Ignored);
    };
    let outcome = match (envelope.result, envelope.error) {
        (_, Some(error)) => Err(error),
        (result, None) => Ok(result.unwrap_or(Value::Null)),
    };
    Ok(Inbound::Reply { id, outcome })
}

fn decode_notification(
    params: &Map<String, Value>,
    received_at: Timestamp,
) -> Result<Inbound, CloudError> {
    let raw_id = params
        .get("varName")
        .and_then(Value::as_str)
        .or_else(|| {
            params
                .get("topic")
                .and_then(Value::as_str)
                .and_then(|topic| topic.split('.').next())
        })
        .ok_or_else(|| CloudError::Protocol("notification without device id".to_string()))?;
    let device_id =
        DeviceId::new(raw_id).map_err(|err| CloudError::Protocol(err.to_string()))?;

    let updates: Vec<FeatureUpdate> = params
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "topic" | "varName" | "id"))
        .filter_map(|(key, value)| {
            let update = decode_attribute(key, value);
            if update.is_none() {
                tracing::trace!(device_id = %device_id, attribute = %key, "ignoring attribute");
            }
            update
        })
        .collect();

    if updates.is_empty() {
        return Ok(Inbound::Ignored);
    }
    Ok(Inbound::Notification(DeviceDelta {
        device_id,
        updates,
        received_at,
    }))
}

/// Decode one `<module>_<port>.<attribute>` entry.
#[must_use]
pub fn decode_attribute(key: &str, entry: &Value) -> Option<FeatureUpdate> {
    let (module_key, attribute) = key.split_once('.')?;
    let (module, _) = Module::parse_key(module_key)?;
    let value = entry.get("value").unwrap_or(entry);
    match (module, attribute) {
        (Module::GarageDoor, "doorState") => value
            .as_i64()
            .filter(|code| (0..=HIGHEST_DOOR_CODE).contains(code))
            .map(|code| FeatureUpdate::DoorState(DoorState::from_vendor_code(code))),
        (Module::GarageDoor, "sensorFlag") => truthy(value).map(FeatureUpdate::DoorObstructed),
        (Module::GarageDoor, "motionSensor") => truthy(value).map(FeatureUpdate::Motion),
        (Module::GarageDoor, "vacationMode") => truthy(value).map(FeatureUpdate::VacationMode),
        (Module::GarageLight, "lightState") => truthy(value).map(FeatureUpdate::Light),
        (Module::BackupCharger, "chargeLevel") => percentage(value).map(FeatureUpdate::Battery),
        (Module::WifiModule, "rssi") => rssi(value).map(FeatureUpdate::WifiSignal),
        (Module::ParkAssistLaser, "moduleState") => truthy(value).map(FeatureUpdate::ParkAssist),
        (Module::Inflator, "moduleState") => truthy(value).map(FeatureUpdate::Inflator),
        (Module::BtSpeaker, "moduleState") => truthy(value).map(FeatureUpdate::Speaker),
        (Module::Fan, "speed") => speed(value).map(FeatureUpdate::FanSpeed),
        _ => None,
    }
}

/// Whether a reply to the authorization request grants access.
#[must_use]
pub fn is_authorized(result: &Value) -> bool {
    result
        .get("authorized")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// A device decoded from its REST detail.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedDevice {
    pub device: Device,
    pub modules: DeviceModules,
}

/// Build a [`Device`] from a `deviceTypeMap`.
///
/// Only modules present in the map become features. A module whose value
/// attribute is missing starts from the neutral value (closed door, light
/// off, empty battery) and is corrected by the next notification.
///
/// # Errors
///
/// Returns [`CloudError::Protocol`] when the resulting device is invalid.
pub fn decode_device(
    device_id: DeviceId,
    name: &str,
    model: Option<&str>,
    type_map: &Map<String, Value>,
    seen_at: Timestamp,
) -> Result<DecodedDevice, CloudError> {
    let mut modules = DeviceModules::default();
    let mut features = Vec::new();
    let mut health = Health {
        online: true,
        wifi_signal: None,
        last_seen: Some(seen_at),
    };

    for (key, entry) in type_map {
        let Some((module, port)) = Module::parse_key(key) else {
            tracing::debug!(device_id = %device_id, module = %key, "skipping unknown module");
            continue;
        };
        if !modules.insert(module, port) {
            tracing::debug!(device_id = %device_id, module = %key, "skipping duplicate module");
            continue;
        }
        let attributes = entry.get("at").and_then(Value::as_object);
        let attribute = |name: &str| {
            attributes
                .and_then(|at| at.get(name))
                .map(|entry| entry.get("value").unwrap_or(entry))
        };
        let flag = |name: &str| attribute(name).and_then(truthy);

        match module {
            Module::GarageDoor => {
                let state = attribute("doorState")
                    .and_then(Value::as_i64)
                    .map_or(DoorState::Unknown, DoorState::from_vendor_code);
                features.push(Feature::Door(DoorStatus {
                    state,
                    obstructed: flag("sensorFlag").unwrap_or(false),
                }));
                if let Some(on) = flag("vacationMode") {
                    features.push(Feature::VacationMode(on));
                }
                if let Some(motion) = flag("motionSensor") {
                    features.push(Feature::Motion(motion));
                }
            }
            Module::GarageLight => {
                features.push(Feature::Light(flag("lightState").unwrap_or(false)));
            }
            Module::BackupCharger => {
                let level = attribute("chargeLevel").and_then(percentage);
                features.push(Feature::Battery(level.unwrap_or(0)));
            }
            Module::WifiModule => {
                if let Some(signal) = attribute("rssi").and_then(rssi) {
                    health.wifi_signal = Some(signal);
                    features.push(Feature::WifiSignal(signal));
                }
            }
            Module::ParkAssistLaser => {
                features.push(Feature::ParkAssist(flag("moduleState").unwrap_or(false)));
            }
            Module::Inflator => {
                features.push(Feature::Inflator(flag("moduleState").unwrap_or(false)));
            }
            Module::BtSpeaker => {
                features.push(Feature::Speaker(flag("moduleState").unwrap_or(false)));
            }
            Module::Fan => {
                let max = DEFAULT_FAN_MAX_SPEED;
                let level = attribute("speed").and_then(speed).unwrap_or(0).min(max);
                features.push(Feature::Fan(FanSpeed { level, max }));
            }
        }
    }

    let mut builder = Device::builder()
        .id(device_id)
        .name(name)
        .features(features)
        .health(health);
    if let Some(model) = model {
        builder = builder.model(model);
    }
    let device = builder
        .build()
        .map_err(|err| CloudError::Protocol(err.to_string()))?;
    Ok(DecodedDevice { device, modules })
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn percentage(value: &Value) -> Option<u8> {
    let raw = value.as_i64()?;
    let level = raw.clamp(0, 100);
    if level != raw {
        tracing::debug!(raw, level, "vendor percentage out of range, clamping");
    }
    u8::try_from(level).ok()
}

fn rssi(value: &Value) -> Option<i32> {
    i32::try_from(value.as_i64()?).ok()
}

fn speed(value: &Value) -> Option<u8> {
    u8::try_from(value.as_u64()?).ok()
}
