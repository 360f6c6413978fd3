//! # ryobi-gdo2mqtt-domain
//!
//! Pure capability model for the Ryobi garage door opener bridge.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error taxonomy, timestamps
//! - Define **Features** (door, light, vacation mode, motion, battery, …) and
//!   the partial updates the vendor cloud sends for them
//! - Define **Devices** (one opener and the features it reported as installed)
//! - Define **Commands** and the lifecycle of a [`PendingCommand`](command::PendingCommand)
//! - Define the cloud **Session** state machine
//! - Define the canonical **frames** decoded from the vendor cloud
//! - Hold the [`CapabilityModel`](model::CapabilityModel), the single source of
//!   truth for current device state
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod command;
pub mod device;
pub mod feature;
pub mod frame;
pub mod model;
pub mod session;
