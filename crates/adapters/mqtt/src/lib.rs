//! # ryobi-gdo2mqtt-adapter-mqtt
//!
//! MQTT adapter: the bridge's link to the broker, built on `rumqttc`.
//!
//! ## Responsibilities
//! - Connect with optional credentials and a retained `offline` last will
//!   on `<base>/status`
//! - Subscribe to `<base>/+/+/set` and the Home Assistant birth topic on
//!   every (re)connect
//! - Turn broker traffic into [`MqttEvent`](ryobi_gdo2mqtt_app::ports::MqttEvent)s
//! - Publish state, availability and discovery messages
//!
//! ## Dependency rule
//! Same as other adapters: depends on `ryobi-gdo2mqtt-app` and
//! `ryobi-gdo2mqtt-domain`.

mod client;
mod config;
mod error;

pub use client::{MqttClient, MqttEvents, connect, options};
pub use config::MqttConfig;
pub use error::MqttError;
