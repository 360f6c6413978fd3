//! Port definitions: traits that adapters implement.
//!
//! Ports are the boundaries between the synchronization engine and the two
//! transports. They are defined here (in `app`) so that both the engine and
//! the adapter crates can depend on them without creating circular
//! dependencies.

pub mod cloud;
pub mod mqtt;

pub use cloud::{CloudSession, FrameSource, SessionEvent};
pub use mqtt::{MqttEvent, MqttMessage, MqttPublisher, MqttSource};
