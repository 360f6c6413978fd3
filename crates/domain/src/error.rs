//! Common error types used across the workspace.
//!
//! [`BridgeError`] is the single error type that crosses port boundaries.
//! Each layer defines its own typed errors and converts via `#[from]` or an
//! explicit `into_domain()`.

use crate::feature::FeatureKind;
use crate::id::{CommandId, DeviceId};

/// Top-level error for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A domain invariant was violated.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A referenced device is not part of the capability model.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// The vendor cloud rejected the credentials. Fatal, never retried.
    #[error("authentication rejected")]
    Auth(#[from] AuthError),

    /// A transport failure talking to the cloud or the broker.
    #[error("network error")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A command was sent while no cloud session was live.
    #[error("no live cloud session")]
    SessionClosed,

    /// The command targets a feature the device does not have.
    #[error("unsupported feature")]
    UnsupportedFeature(#[from] UnsupportedFeatureError),

    /// The command payload is outside the feature's value grammar.
    #[error("invalid command")]
    InvalidCommand(#[from] InvalidCommandError),

    /// The command was sent but never acknowledged.
    #[error("command {0} timed out")]
    TimedOut(CommandId),
}

impl BridgeError {
    /// Wrap any transport error as [`BridgeError::Network`].
    pub fn network(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Network(Box::new(err))
    }

    /// Short machine-readable code published on the diagnostic topic.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "unknown_device",
            Self::Auth(_) => "auth",
            Self::Network(_) => "network",
            Self::SessionClosed => "session_closed",
            Self::UnsupportedFeature(_) => "unsupported_feature",
            Self::InvalidCommand(_) => "invalid_command",
            Self::TimedOut(_) => "timed_out",
        }
    }

    /// Whether the failure may go away on its own (reconnect, retry later).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::SessionClosed)
    }
}

/// Domain invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("name must not be empty")]
    EmptyName,

    #[error("device id must not be empty")]
    EmptyDeviceId,

    #[error("device id {0:?} contains characters not allowed in MQTT topics")]
    InvalidDeviceId(String),

    #[error("feature {0} is listed more than once")]
    DuplicateFeature(FeatureKind),

    #[error("battery level {0} is outside 0..=100")]
    BatteryOutOfRange(u8),

    #[error("fan speed {speed} is above the supported maximum {max}")]
    FanSpeedOutOfRange { speed: u8, max: u8 },
}

/// A lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{entity} {id} not found")]
pub struct NotFoundError {
    pub entity: &'static str,
    pub id: String,
}

/// The vendor cloud refused the login or the socket authorization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authentication rejected: {reason}")]
pub struct AuthError {
    pub reason: String,
}

/// A command targets a feature that is not installed on the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device {device_id} has no {feature} feature")]
pub struct UnsupportedFeatureError {
    pub device_id: DeviceId,
    pub feature: FeatureKind,
}

/// A command payload or topic that cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidCommandError {
    #[error("topic {0:?} is not a command topic")]
    UnknownTopic(String),

    #[error("{0} is read-only")]
    ReadOnly(FeatureKind),

    #[error("payload {payload:?} is not accepted by {feature}")]
    Payload {
        feature: FeatureKind,
        payload: String,
    },

    #[error("{feature} value {value} is outside {min}..={max}")]
    OutOfRange {
        feature: FeatureKind,
        value: i64,
        min: i64,
        max: i64,
    },
}
