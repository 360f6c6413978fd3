//! Topic mapper: pure translation between the capability model and MQTT.
//!
//! State and command topics are both derived from the same
//! `(device id, feature)` key:
//!
//! ```text
//! <base>/<device_id>/<feature>/state
//! <base>/<device_id>/<feature>/set
//! <discovery_prefix>/<component>/<device_id>/<feature>/config
//! ```
//!
//! [`decode_command`] accepts exactly what [`encode_command`] produces, and
//! for every commandable feature the state payload is a valid command
//! payload for the same value.

use serde::Serialize;

use ryobi_gdo2mqtt_domain::command::{Command, DoorCommand};
use ryobi_gdo2mqtt_domain::device::Device;
use ryobi_gdo2mqtt_domain::error::InvalidCommandError;
use ryobi_gdo2mqtt_domain::feature::{DoorState, Feature, FeatureKind};
use ryobi_gdo2mqtt_domain::id::DeviceId;

use crate::discovery::DiscoveryRecord;

pub const DEFAULT_BASE_TOPIC: &str = "ryobi_gdo_2_mqtt";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";
/// Resets a Home Assistant cover to the unknown state.
const PAYLOAD_DOOR_UNKNOWN: &str = "None";
const MANUFACTURER: &str = "Ryobi";

/// Home Assistant component used for a feature.
#[must_use]
pub fn component(kind: FeatureKind) -> &'static str {
    match kind {
        FeatureKind::Door => "cover",
        FeatureKind::Light => "light",
        FeatureKind::VacationMode
        | FeatureKind::ParkAssist
        | FeatureKind::Inflator
        | FeatureKind::Speaker => "switch",
        FeatureKind::Motion => "binary_sensor",
        FeatureKind::Battery | FeatureKind::WifiSignal => "sensor",
        FeatureKind::Fan => "fan",
    }
}

/// Builds every topic the bridge publishes to or subscribes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMapper {
    base: String,
    discovery_prefix: String,
}

impl Default for TopicMapper {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX)
    }
}

impl TopicMapper {
    #[must_use]
    pub fn new(base: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        let trim = |topic: String| topic.trim_end_matches('/').to_string();
        Self {
            base: trim(base.into()),
            discovery_prefix: trim(discovery_prefix.into()),
        }
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Bridge availability, also the MQTT last will.
    #[must_use]
    pub fn bridge_status_topic(&self) -> String {
        format!("{}/status", self.base)
    }

    /// Home Assistant birth message topic.
    #[must_use]
    pub fn birth_topic(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    /// Wildcard subscription matching every command topic.
    #[must_use]
    pub fn command_subscription(&self) -> String {
        format!("{}/+/+/set", self.base)
    }

    #[must_use]
    pub fn availability_topic(&self, device_id: &DeviceId) -> String {
        format!("{}/{device_id}/availability", self.base)
    }

    #[must_use]
    pub fn diagnostic_topic(&self, device_id: &DeviceId) -> String {
        format!("{}/{device_id}/diagnostic", self.base)
    }

    #[must_use]
    pub fn state_topic(&self, device_id: &DeviceId, kind: FeatureKind) -> String {
        format!("{}/{device_id}/{kind}/state", self.base)
    }

    #[must_use]
    pub fn command_topic(&self, device_id: &DeviceId, kind: FeatureKind) -> String {
        format!("{}/{device_id}/{kind}/set", self.base)
    }

    #[must_use]
    pub fn attributes_topic(&self, device_id: &DeviceId, kind: FeatureKind) -> String {
        format!("{}/{device_id}/{kind}/attributes", self.base)
    }

    #[must_use]
    pub fn discovery_topic(&self, device_id: &DeviceId, kind: FeatureKind) -> String {
        format!(
            "{}/{}/{device_id}/{kind}/config",
            self.discovery_prefix,
            component(kind)
        )
    }

    /// Reverse of [`command_topic`](Self::command_topic).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCommandError::UnknownTopic`] for anything that is not
    /// `<base>/<device_id>/<feature>/set` with a valid id and known feature.
    pub fn parse_command_topic(
        &self,
        topic: &str,
    ) -> Result<(DeviceId, FeatureKind), InvalidCommandError> {
        let unknown = || InvalidCommandError::UnknownTopic(topic.to_string());
        let rest = topic
            .strip_prefix(self.base.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(unknown)?;
        let mut segments = rest.split('/');
        match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some(device), Some(feature), Some("set"), None) => {
                let device_id = DeviceId::new(device).map_err(|_| unknown())?;
                let kind = feature.parse().map_err(|_| unknown())?;
                Ok((device_id, kind))
            }
            _ => Err(unknown()),
        }
    }

    /// Home Assistant discovery message for one installed feature.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be encoded.
    pub fn discovery_for(
        &self,
        device: &Device,
        feature: &Feature,
    ) -> Result<DiscoveryRecord, serde_json::Error> {
        let kind = feature.kind();
        let id = &device.id;
        let mut payload = DiscoveryPayload {
            name: entity_name(kind),
            unique_id: format!("{id}_{kind}"),
            object_id: format!("{}_{kind}", device.name.to_lowercase().replace(' ', "_")),
            device: DeviceInfo {
                identifiers: vec![id.to_string()],
                name: &device.name,
                manufacturer: MANUFACTURER,
                model: &device.model,
            },
            availability: [
                Availability::new(self.bridge_status_topic()),
                Availability::new(self.availability_topic(id)),
            ],
            availability_mode: "all",
            state_topic: self.state_topic(id, kind),
            ..DiscoveryPayload::default()
        };
        if kind.is_commandable() {
            payload.command_topic = Some(self.command_topic(id, kind));
        }

        match feature {
            Feature::Door(_) => {
                payload.device_class = Some("garage");
                payload.json_attributes_topic = Some(self.attributes_topic(id, kind));
                payload.payload_open = Some(DoorCommand::Open.as_str());
                payload.payload_close = Some(DoorCommand::Close.as_str());
                payload.payload_stop = Some(DoorCommand::Stop.as_str());
                payload.state_open = Some(DoorState::Open.as_str());
                payload.state_closed = Some(DoorState::Closed.as_str());
                payload.state_opening = Some(DoorState::Opening.as_str());
                payload.state_closing = Some(DoorState::Closing.as_str());
            }
            Feature::Light(_)
            | Feature::VacationMode(_)
            | Feature::ParkAssist(_)
            | Feature::Inflator(_)
            | Feature::Speaker(_) => {
                payload.payload_on = Some(PAYLOAD_ON);
                payload.payload_off = Some(PAYLOAD_OFF);
                payload.icon = icon(kind);
            }
            Feature::Motion(_) => {
                payload.device_class = Some("motion");
                payload.payload_on = Some(PAYLOAD_ON);
                payload.payload_off = Some(PAYLOAD_OFF);
            }
            Feature::Battery(_) => {
                payload.device_class = Some("battery");
                payload.unit_of_measurement = Some("%");
                payload.state_class = Some("measurement");
                payload.entity_category = Some("diagnostic");
            }
            Feature::WifiSignal(_) => {
                payload.device_class = Some("signal_strength");
                payload.unit_of_measurement = Some("dBm");
                payload.state_class = Some("measurement");
                payload.entity_category = Some("diagnostic");
            }
            Feature::Fan(speed) => {
                payload.command_template =
                    Some(format!("{{{{ 0 if value == 'OFF' else {} }}}}", speed.max));
                payload.state_value_template =
                    Some("{{ 'OFF' if value | int == 0 else 'ON' }}".to_string());
                payload.percentage_state_topic = Some(self.state_topic(id, kind));
                payload.percentage_command_topic = Some(self.command_topic(id, kind));
                payload.speed_range_min = Some(1);
                payload.speed_range_max = Some(speed.max);
            }
        }

        Ok(DiscoveryRecord {
            topic: self.discovery_topic(id, kind),
            payload: serde_json::to_string(&payload)?,
        })
    }
}

fn entity_name(kind: FeatureKind) -> &'static str {
    match kind {
        FeatureKind::Door => "Door",
        FeatureKind::Light => "Light",
        FeatureKind::VacationMode => "Vacation Mode",
        FeatureKind::Motion => "Motion",
        FeatureKind::Battery => "Backup Battery",
        FeatureKind::WifiSignal => "Wi-Fi Signal",
        FeatureKind::ParkAssist => "Park Assist",
        FeatureKind::Inflator => "Inflator",
        FeatureKind::Speaker => "Speaker",
        FeatureKind::Fan => "Fan",
    }
}

fn icon(kind: FeatureKind) -> Option<&'static str> {
    match kind {
        FeatureKind::VacationMode => Some("mdi:beach"),
        FeatureKind::ParkAssist => Some("mdi:car-brake-parking"),
        FeatureKind::Inflator => Some("mdi:tire"),
        FeatureKind::Speaker => Some("mdi:speaker-bluetooth"),
        _ => None,
    }
}

/// State payload for a feature value.
#[must_use]
pub fn encode_state(feature: &Feature) -> String {
    match *feature {
        Feature::Door(status) => match status.state {
            DoorState::Unknown => PAYLOAD_DOOR_UNKNOWN.to_string(),
            state => state.as_str().to_string(),
        },
        Feature::Light(on)
        | Feature::VacationMode(on)
        | Feature::Motion(on)
        | Feature::ParkAssist(on)
        | Feature::Inflator(on)
        | Feature::Speaker(on) => on_off(on).to_string(),
        Feature::Battery(level) => level.to_string(),
        Feature::WifiSignal(rssi) => rssi.to_string(),
        Feature::Fan(speed) => speed.level.to_string(),
    }
}

/// JSON attributes published next to the state, if the feature has any.
#[must_use]
pub fn encode_attributes(feature: &Feature) -> Option<String> {
    match feature {
        Feature::Door(status) => Some(
            serde_json::json!({ "obstructed": status.obstructed }).to_string(),
        ),
        _ => None,
    }
}

/// Command payload, as Home Assistant sends it on the `set` topic.
#[must_use]
pub fn encode_command(command: &Command) -> String {
    command.value_label()
}

/// Decode a `set` payload against the installed feature.
///
/// # Errors
///
/// Returns [`InvalidCommandError::ReadOnly`] for sensors,
/// [`InvalidCommandError::Payload`] for anything outside the feature's
/// grammar and [`InvalidCommandError::OutOfRange`] for a fan speed beyond
/// the device's scale. Payloads must match exactly: no padding, no sign
/// on positive numbers, no leading zeros. Values are never clamped.
pub fn decode_command(installed: &Feature, payload: &str) -> Result<Command, InvalidCommandError> {
    let kind = installed.kind();
    let invalid = || InvalidCommandError::Payload {
        feature: kind,
        payload: payload.to_string(),
    };
    let switch = || match payload {
        PAYLOAD_ON => Ok(true),
        PAYLOAD_OFF => Ok(false),
        _ => Err(invalid()),
    };

    match installed {
        Feature::Door(_) => match payload {
            "OPEN" => Ok(Command::Door(DoorCommand::Open)),
            "CLOSE" => Ok(Command::Door(DoorCommand::Close)),
            "STOP" => Ok(Command::Door(DoorCommand::Stop)),
            _ => Err(invalid()),
        },
        Feature::Light(_) => switch().map(Command::Light),
        Feature::VacationMode(_) => switch().map(Command::VacationMode),
        Feature::ParkAssist(_) => switch().map(Command::ParkAssist),
        Feature::Inflator(_) => switch().map(Command::Inflator),
        Feature::Speaker(_) => switch().map(Command::Speaker),
        Feature::Fan(speed) => {
            let value = parse_integer(payload).ok_or_else(invalid)?;
            u8::try_from(value)
                .ok()
                .filter(|level| *level <= speed.max)
                .map(Command::Fan)
                .ok_or(InvalidCommandError::OutOfRange {
                    feature: kind,
                    value,
                    min: 0,
                    max: i64::from(speed.max),
                })
        }
        Feature::Motion(_) | Feature::Battery(_) | Feature::WifiSignal(_) => {
            Err(InvalidCommandError::ReadOnly(kind))
        }
    }
}

/// Canonical decimal integer, as `i64::to_string` would print it.
fn parse_integer(payload: &str) -> Option<i64> {
    let digits = payload.strip_prefix('-').unwrap_or(payload);
    let canonical = !digits.is_empty()
        && digits.bytes().all(|byte| byte.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
        && payload != "-0";
    if canonical { payload.parse().ok() } else { None }
}

fn on_off(on: bool) -> &'static str {
    if on { PAYLOAD_ON } else { PAYLOAD_OFF }
}

#[derive(Debug, Default, Serialize)]
struct Availability {
    topic: String,
    payload_available: &'static str,
    payload_not_available: &'static str,
}

impl Availability {
    fn new(topic: String) -> Self {
        Self {
            topic,
            payload_available: PAYLOAD_ONLINE,
            payload_not_available: PAYLOAD_OFFLINE,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct DeviceInfo<'a> {
    identifiers: Vec<String>,
    name: &'a str,
    manufacturer: &'static str,
    model: &'a str,
}

#[derive(Debug, Default, Serialize)]
struct DiscoveryPayload<'a> {
    name: &'static str,
    unique_id: String,
    object_id: String,
    device: DeviceInfo<'a>,
    availability: [Availability; 2],
    availability_mode: &'static str,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_attributes_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_category: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_open: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_close: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_stop: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_open: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_closed: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_opening: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_closing: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    percentage_state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    percentage_command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed_range_min: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed_range_max: Option<u8>,
}
