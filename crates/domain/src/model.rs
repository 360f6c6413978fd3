//! Capability model: every known device and its current feature values.

use std::collections::BTreeMap;

use crate::device::Device;
use crate::error::NotFoundError;
use crate::id::DeviceId;

/// Single source of truth for current device state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityModel {
    devices: BTreeMap<DeviceId, Device>,
}

impl CapabilityModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    /// Look up a device, failing with [`NotFoundError`].
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError`] when `id` has never been seen.
    pub fn require(&self, id: &DeviceId) -> Result<&Device, NotFoundError> {
        self.devices.get(id).ok_or_else(|| NotFoundError {
            entity: "Device",
            id: id.to_string(),
        })
    }

    /// Insert or replace a device, returning the previous entry.
    pub fn insert(&mut self, device: Device) -> Option<Device> {
        self.devices.insert(device.id.clone(), device)
    }

    pub fn remove(&mut self, id: &DeviceId) -> Option<Device> {
        self.devices.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Devices in id order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> Device {
        Device::builder()
            .id(DeviceId::new(id).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn should_iterate_devices_in_id_order() {
        let mut model = CapabilityModel::new();
        model.insert(device("b"));
        model.insert(device("a"));

        let ids: Vec<_> = model.ids().map(DeviceId::as_str).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn should_return_not_found_for_unknown_device() {
        let model = CapabilityModel::new();
        let err = model.require(&DeviceId::new("ghost").unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "Device ghost not found");
    }

    #[test]
    fn should_replace_existing_device() {
        let mut model = CapabilityModel::new();
        assert!(model.insert(device("a")).is_none());
        assert!(model.insert(device("a")).is_some());
        assert_eq!(model.len(), 1);
    }
}
