//! Discovery registry: what has already been announced to Home Assistant.

use std::collections::BTreeMap;

use ryobi_gdo2mqtt_domain::feature::FeatureKind;
use ryobi_gdo2mqtt_domain::id::DeviceId;

/// One discovery message as published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub topic: String,
    pub payload: String,
}

/// Published discovery records keyed by `(device, feature)`.
#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    records: BTreeMap<(DeviceId, FeatureKind), DiscoveryRecord>,
}

impl DiscoveryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a record. Returns `true` when it is new or differs from the
    /// one already published, i.e. when it must be (re)published.
    pub fn remember(
        &mut self,
        device_id: &DeviceId,
        kind: FeatureKind,
        record: DiscoveryRecord,
    ) -> bool {
        let key = (device_id.clone(), kind);
        if self.records.get(&key) == Some(&record) {
            return false;
        }
        self.records.insert(key, record);
        true
    }

    /// Forget one record, returning it if it was published.
    pub fn forget(&mut self, device_id: &DeviceId, kind: FeatureKind) -> Option<DiscoveryRecord> {
        self.records.remove(&(device_id.clone(), kind))
    }

    /// Forget every record of a device.
    pub fn forget_device(&mut self, device_id: &DeviceId) -> Vec<(FeatureKind, DiscoveryRecord)> {
        let kinds: Vec<FeatureKind> = self
            .records
            .keys()
            .filter(|(id, _)| id == device_id)
            .map(|(_, kind)| *kind)
            .collect();
        kinds
            .into_iter()
            .filter_map(|kind| self.forget(device_id, kind).map(|record| (kind, record)))
            .collect()
    }

    #[must_use]
    pub fn get(&self, device_id: &DeviceId, kind: FeatureKind) -> Option<&DiscoveryRecord> {
        self.records.get(&(device_id.clone(), kind))
    }

    pub fn records(&self) -> impl Iterator<Item = &DiscoveryRecord> {
        self.records.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &str) -> DiscoveryRecord {
        DiscoveryRecord {
            topic: "homeassistant/cover/gdo1/door/config".to_string(),
            payload: payload.to_string(),
        }
    }

    fn id(raw: &str) -> DeviceId {
        DeviceId::new(raw).unwrap()
    }

    #[test]
    fn should_suppress_identical_record() {
        let mut registry = DiscoveryRegistry::new();
        assert!(registry.remember(&id("gdo1"), FeatureKind::Door, record("{}")));
        assert!(!registry.remember(&id("gdo1"), FeatureKind::Door, record("{}")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn should_republish_changed_record() {
        let mut registry = DiscoveryRegistry::new();
        registry.remember(&id("gdo1"), FeatureKind::Door, record("{}"));
        assert!(registry.remember(&id("gdo1"), FeatureKind::Door, record(r#"{"name":"x"}"#)));
    }

    #[test]
    fn should_forget_all_records_of_a_device() {
        let mut registry = DiscoveryRegistry::new();
        registry.remember(&id("gdo1"), FeatureKind::Door, record("a"));
        registry.remember(&id("gdo1"), FeatureKind::Light, record("b"));
        registry.remember(&id("gdo2"), FeatureKind::Door, record("c"));

        let forgotten = registry.forget_device(&id("gdo1"));

        let kinds: Vec<_> = forgotten.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(kinds, vec![FeatureKind::Door, FeatureKind::Light]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id("gdo2"), FeatureKind::Door).is_some());
    }
}
