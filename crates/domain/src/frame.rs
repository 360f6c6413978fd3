//! Canonical frames decoded from the vendor cloud.
//!
//! The cloud adapter turns loosely typed vendor JSON into one of these at
//! the boundary. Shapes it does not understand never get this far.

use crate::device::Device;
use crate::feature::FeatureUpdate;
use crate::id::{CommandId, DeviceId};
use crate::time::Timestamp;

#[derive(Debug, Clone, PartialEq)]
pub enum CloudFrame {
    /// Full state of every bridged device, sent after each (re)connect.
    Snapshot(Vec<Device>),
    /// Incremental attribute changes for one device.
    Delta(DeviceDelta),
    /// Reply to a command frame.
    Ack(CommandAck),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDelta {
    pub device_id: DeviceId,
    pub updates: Vec<FeatureUpdate>,
    pub received_at: Timestamp,
}

/// The cloud echoed the request id of a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub command_id: CommandId,
    pub accepted: bool,
}
