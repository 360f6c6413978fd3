//! Features: the optional sub-systems a garage door opener may expose.
//!
//! A [`Feature`] carries the current value of one installed sub-system. The
//! vendor cloud reports changes attribute by attribute, which arrive as
//! [`FeatureUpdate`]s and are merged into the installed feature with
//! [`Feature::with_update`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Upper bound of the fan speed scale when the vendor does not report one.
pub const DEFAULT_FAN_MAX_SPEED: u8 = 100;

/// Discriminant of [`Feature`], also used as the feature segment in topics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Door,
    Light,
    VacationMode,
    Motion,
    Battery,
    WifiSignal,
    ParkAssist,
    Inflator,
    Speaker,
    Fan,
}

impl FeatureKind {
    /// Every kind, in canonical order.
    pub const ALL: [Self; 10] = [
        Self::Door,
        Self::Light,
        Self::VacationMode,
        Self::Motion,
        Self::Battery,
        Self::WifiSignal,
        Self::ParkAssist,
        Self::Inflator,
        Self::Speaker,
        Self::Fan,
    ];

    /// Stable lowercase name used in topics and command frames.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Door => "door",
            Self::Light => "light",
            Self::VacationMode => "vacation_mode",
            Self::Motion => "motion",
            Self::Battery => "battery",
            Self::WifiSignal => "wifi_signal",
            Self::ParkAssist => "park_assist",
            Self::Inflator => "inflator",
            Self::Speaker => "speaker",
            Self::Fan => "fan",
        }
    }

    /// Whether Home Assistant may send commands to this feature.
    #[must_use]
    pub fn is_commandable(self) -> bool {
        !matches!(self, Self::Motion | Self::Battery | Self::WifiSignal)
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a [`FeatureKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown feature {0:?}")]
pub struct UnknownFeatureError(pub String);

impl FromStr for FeatureKind {
    type Err = UnknownFeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownFeatureError(s.to_string()))
    }
}

/// Position of the door as reported by the opener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    Open,
    Closed,
    Opening,
    Closing,
    #[default]
    Unknown,
}

impl DoorState {
    /// Decode the vendor `doorState` code. Fault (`4`) and anything
    /// unrecognised map to [`Unknown`](Self::Unknown).
    #[must_use]
    pub fn from_vendor_code(code: i64) -> Self {
        match code {
            0 => Self::Closed,
            1 => Self::Open,
            2 => Self::Closing,
            3 => Self::Opening,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Closing => "closing",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DoorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Door position plus the safety beam obstruction flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DoorStatus {
    pub state: DoorState,
    pub obstructed: bool,
}

/// Fan speed and the top of the speed scale the device supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanSpeed {
    pub level: u8,
    pub max: u8,
}

impl Default for FanSpeed {
    fn default() -> Self {
        Self {
            level: 0,
            max: DEFAULT_FAN_MAX_SPEED,
        }
    }
}

/// One installed feature and its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "feature", content = "value", rename_all = "snake_case")]
pub enum Feature {
    Door(DoorStatus),
    Light(bool),
    VacationMode(bool),
    Motion(bool),
    /// Backup battery charge, percent.
    Battery(u8),
    /// Wi-Fi RSSI, dBm.
    WifiSignal(i32),
    ParkAssist(bool),
    Inflator(bool),
    Speaker(bool),
    Fan(FanSpeed),
}

impl Feature {
    #[must_use]
    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Door(_) => FeatureKind::Door,
            Self::Light(_) => FeatureKind::Light,
            Self::VacationMode(_) => FeatureKind::VacationMode,
            Self::Motion(_) => FeatureKind::Motion,
            Self::Battery(_) => FeatureKind::Battery,
            Self::WifiSignal(_) => FeatureKind::WifiSignal,
            Self::ParkAssist(_) => FeatureKind::ParkAssist,
            Self::Inflator(_) => FeatureKind::Inflator,
            Self::Speaker(_) => FeatureKind::Speaker,
            Self::Fan(_) => FeatureKind::Fan,
        }
    }

    /// Check value invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::BatteryOutOfRange`] or
    /// [`ValidationError::FanSpeedOutOfRange`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            Self::Battery(level) if level > 100 => Err(ValidationError::BatteryOutOfRange(level)),
            Self::Fan(FanSpeed { level, max }) if level > max => {
                Err(ValidationError::FanSpeedOutOfRange { speed: level, max })
            }
            _ => Ok(()),
        }
    }

    /// Whether merging `update` would clamp its value into this feature's
    /// range.
    #[must_use]
    pub fn clamps(&self, update: FeatureUpdate) -> bool {
        match (self, update) {
            (Self::Battery(_), FeatureUpdate::Battery(level)) => level > 100,
            (Self::Fan(speed), FeatureUpdate::FanSpeed(level)) => level > speed.max,
            _ => false,
        }
    }

    /// Merge a partial update into this feature.
    ///
    /// Returns `None` when the update targets a different kind.
    #[must_use]
    pub fn with_update(&self, update: FeatureUpdate) -> Option<Self> {
        let merged = match (*self, update) {
            (Self::Door(status), FeatureUpdate::DoorState(state)) => {
                Self::Door(DoorStatus { state, ..status })
            }
            (Self::Door(status), FeatureUpdate::DoorObstructed(obstructed)) => {
                Self::Door(DoorStatus {
                    obstructed,
                    ..status
                })
            }
            (Self::Light(_), FeatureUpdate::Light(on)) => Self::Light(on),
            (Self::VacationMode(_), FeatureUpdate::VacationMode(on)) => Self::VacationMode(on),
            (Self::Motion(_), FeatureUpdate::Motion(on)) => Self::Motion(on),
            (Self::Battery(_), FeatureUpdate::Battery(level)) => Self::Battery(level.min(100)),
            (Self::WifiSignal(_), FeatureUpdate::WifiSignal(rssi)) => Self::WifiSignal(rssi),
            (Self::ParkAssist(_), FeatureUpdate::ParkAssist(on)) => Self::ParkAssist(on),
            (Self::Inflator(_), FeatureUpdate::Inflator(on)) => Self::Inflator(on),
            (Self::Speaker(_), FeatureUpdate::Speaker(on)) => Self::Speaker(on),
            (Self::Fan(speed), FeatureUpdate::FanSpeed(level)) => Self::Fan(FanSpeed {
                level: level.min(speed.max),
                ..speed
            }),
            _ => return None,
        };
        Some(merged)
    }
}

/// A single attribute change reported by the vendor cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "attribute", content = "value", rename_all = "snake_case")]
pub enum FeatureUpdate {
    DoorState(DoorState),
    DoorObstructed(bool),
    Light(bool),
    VacationMode(bool),
    Motion(bool),
    Battery(u8),
    WifiSignal(i32),
    ParkAssist(bool),
    Inflator(bool),
    Speaker(bool),
    FanSpeed(u8),
}

impl FeatureUpdate {
    /// The feature this update applies to.
    #[must_use]
    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::DoorState(_) | Self::DoorObstructed(_) => FeatureKind::Door,
            Self::Light(_) => FeatureKind::Light,
            Self::VacationMode(_) => FeatureKind::VacationMode,
            Self::Motion(_) => FeatureKind::Motion,
            Self::Battery(_) => FeatureKind::Battery,
            Self::WifiSignal(_) => FeatureKind::WifiSignal,
            Self::ParkAssist(_) => FeatureKind::ParkAssist,
            Self::Inflator(_) => FeatureKind::Inflator,
            Self::Speaker(_) => FeatureKind::Speaker,
            Self::FanSpeed(_) => FeatureKind::Fan,
        }
    }
}
