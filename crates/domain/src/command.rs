//! Commands issued from Home Assistant and their acknowledgment lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::feature::{DoorState, Feature, FeatureKind, FeatureUpdate};
use crate::id::{CommandId, DeviceId};
use crate::time::Timestamp;

/// Actions accepted by the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DoorCommand {
    Open,
    Close,
    Stop,
}

impl DoorCommand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Stop => "STOP",
        }
    }
}

/// A validated desired value for one commandable feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "feature", content = "value", rename_all = "snake_case")]
pub enum Command {
    Door(DoorCommand),
    Light(bool),
    VacationMode(bool),
    ParkAssist(bool),
    Inflator(bool),
    Speaker(bool),
    Fan(u8),
}

impl Command {
    #[must_use]
    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Door(_) => FeatureKind::Door,
            Self::Light(_) => FeatureKind::Light,
            Self::VacationMode(_) => FeatureKind::VacationMode,
            Self::ParkAssist(_) => FeatureKind::ParkAssist,
            Self::Inflator(_) => FeatureKind::Inflator,
            Self::Speaker(_) => FeatureKind::Speaker,
            Self::Fan(_) => FeatureKind::Fan,
        }
    }

    /// The value as it travels in a command frame: `OPEN`, `ON`, `3`, ….
    #[must_use]
    pub fn value_label(&self) -> String {
        match *self {
            Self::Door(action) => action.as_str().to_string(),
            Self::Light(on)
            | Self::VacationMode(on)
            | Self::ParkAssist(on)
            | Self::Inflator(on)
            | Self::Speaker(on) => String::from(if on { "ON" } else { "OFF" }),
            Self::Fan(speed) => speed.to_string(),
        }
    }

    /// State to assume once the cloud acknowledged the command.
    ///
    /// A stopped door has no predictable position, so `STOP` yields `None`.
    #[must_use]
    pub fn optimistic_update(&self) -> Option<FeatureUpdate> {
        match *self {
            Self::Door(DoorCommand::Open) => Some(FeatureUpdate::DoorState(DoorState::Opening)),
            Self::Door(DoorCommand::Close) => Some(FeatureUpdate::DoorState(DoorState::Closing)),
            Self::Door(DoorCommand::Stop) => None,
            Self::Light(on) => Some(FeatureUpdate::Light(on)),
            Self::VacationMode(on) => Some(FeatureUpdate::VacationMode(on)),
            Self::ParkAssist(on) => Some(FeatureUpdate::ParkAssist(on)),
            Self::Inflator(on) => Some(FeatureUpdate::Inflator(on)),
            Self::Speaker(on) => Some(FeatureUpdate::Speaker(on)),
            Self::Fan(speed) => Some(FeatureUpdate::FanSpeed(speed)),
        }
    }

    /// Whether an observed feature value shows this command took effect.
    ///
    /// Used to correlate acknowledgments when the cloud does not echo an id.
    #[must_use]
    pub fn is_satisfied_by(&self, feature: &Feature) -> bool {
        match (*self, feature) {
            (Self::Door(DoorCommand::Open), Feature::Door(status)) => {
                matches!(status.state, DoorState::Opening | DoorState::Open)
            }
            (Self::Door(DoorCommand::Close), Feature::Door(status)) => {
                matches!(status.state, DoorState::Closing | DoorState::Closed)
            }
            (Self::Light(want), Feature::Light(have))
            | (Self::VacationMode(want), Feature::VacationMode(have))
            | (Self::ParkAssist(want), Feature::ParkAssist(have))
            | (Self::Inflator(want), Feature::Inflator(have))
            | (Self::Speaker(want), Feature::Speaker(have)) => want == *have,
            (Self::Fan(want), Feature::Fan(have)) => want == have.level,
            _ => false,
        }
    }
}

/// The frame handed to the cloud session: `{deviceId, feature, value}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCommand {
    #[serde(skip)]
    pub id: CommandId,
    pub device_id: DeviceId,
    pub feature: FeatureKind,
    pub value: String,
    #[serde(skip)]
    pub command: Command,
}

impl OutboundCommand {
    #[must_use]
    pub fn new(id: CommandId, device_id: DeviceId, command: Command) -> Self {
        Self {
            id,
            device_id,
            feature: command.kind(),
            value: command.value_label(),
            command,
        }
    }
}

/// Final state of a [`PendingCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Acknowledged,
    Rejected,
    TimedOut,
}

impl CommandOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when resolving a command that already has an outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command {id} already resolved as {outcome}")]
pub struct AlreadyResolvedError {
    pub id: CommandId,
    pub outcome: CommandOutcome,
}

/// A command sent to the cloud and awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub id: CommandId,
    pub device_id: DeviceId,
    pub command: Command,
    pub issued_at: Timestamp,
    outcome: Option<CommandOutcome>,
}

impl PendingCommand {
    #[must_use]
    pub fn new(device_id: DeviceId, command: Command, issued_at: Timestamp) -> Self {
        Self {
            id: CommandId::new(),
            device_id,
            command,
            issued_at,
            outcome: None,
        }
    }

    #[must_use]
    pub fn outcome(&self) -> Option<CommandOutcome> {
        self.outcome
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// Record the final outcome. An outcome, once set, never changes.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyResolvedError`] if the command already has an outcome.
    pub fn resolve(&mut self, outcome: CommandOutcome) -> Result<(), AlreadyResolvedError> {
        if let Some(existing) = self.outcome {
            return Err(AlreadyResolvedError {
                id: self.id,
                outcome: existing,
            });
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Frame to hand to the cloud session.
    #[must_use]
    pub fn to_outbound(&self) -> OutboundCommand {
        OutboundCommand::new(self.id, self.device_id.clone(), self.command)
    }
}
