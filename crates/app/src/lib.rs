//! # ryobi-gdo2mqtt-app
//!
//! Synchronization engine: **port definitions** (traits) and the logic that
//! keeps the capability model and MQTT in step.
//!
//! ## Responsibilities
//! - Define **port traits** the adapters implement:
//!   - `CloudSession` / `FrameSource`: the vendor cloud session
//!   - `MqttPublisher` / `MqttSource`: the broker connection
//! - Reconcile cloud frames into the capability model (`reconciler`)
//! - Map `(device, feature, value)` to topics and payloads (`topics`)
//! - Project model changes onto MQTT, discovery included (`projection`)
//! - Validate and relay Home Assistant commands (`dispatcher`)
//! - Run both flows and own shutdown (`bridge`)
//!
//! ## Dependency rule
//! Depends on `ryobi-gdo2mqtt-domain` only (plus `tokio` for timers and
//! tasks). Never imports adapter crates. Adapters depend on *this* crate,
//! not the reverse.

pub mod bridge;
pub mod discovery;
pub mod dispatcher;
pub mod ports;
pub mod projection;
pub mod reconciler;
pub mod state;
pub mod topics;
