//! Device: one garage door opener and the features it reported as installed.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, UnsupportedFeatureError, ValidationError};
use crate::feature::{Feature, FeatureKind, FeatureUpdate};
use crate::id::DeviceId;
use crate::time::Timestamp;

/// Last-known connectivity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Health {
    pub online: bool,
    /// Wi-Fi RSSI in dBm, when the wifi module reported one.
    pub wifi_signal: Option<i32>,
    pub last_seen: Option<Timestamp>,
}

/// A garage door opener known to the vendor cloud.
///
/// `features` is kept sorted by [`FeatureKind`] and holds at most one entry
/// per kind. Only hardware the vendor reported is ever listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub model: String,
    pub features: Vec<Feature>,
    pub health: Health,
}

impl Device {
    /// Create a builder for constructing a [`Device`].
    #[must_use]
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::default()
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Validation`] when `name` is empty, a feature
    /// kind is listed twice, or a feature value is out of range.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        for (index, feature) in self.features.iter().enumerate() {
            feature.validate()?;
            if self.features[..index]
                .iter()
                .any(|other| other.kind() == feature.kind())
            {
                return Err(ValidationError::DuplicateFeature(feature.kind()).into());
            }
        }
        Ok(())
    }

    /// Current value of an installed feature.
    #[must_use]
    pub fn feature(&self, kind: FeatureKind) -> Option<&Feature> {
        self.features.iter().find(|feature| feature.kind() == kind)
    }

    #[must_use]
    pub fn has_feature(&self, kind: FeatureKind) -> bool {
        self.feature(kind).is_some()
    }

    /// Installed feature kinds, in canonical order.
    pub fn feature_kinds(&self) -> impl Iterator<Item = FeatureKind> + '_ {
        self.features.iter().map(Feature::kind)
    }

    /// Merge a vendor update into the matching installed feature.
    ///
    /// Returns `Ok(None)` when the merged value equals the current one.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedFeatureError`] when the feature is not installed.
    pub fn apply_update(
        &mut self,
        update: FeatureUpdate,
    ) -> Result<Option<(Feature, Feature)>, UnsupportedFeatureError> {
        let kind = update.kind();
        let slot = self
            .features
            .iter_mut()
            .find(|feature| feature.kind() == kind)
            .ok_or_else(|| UnsupportedFeatureError {
                device_id: self.id.clone(),
                feature: kind,
            })?;
        let old = *slot;
        let Some(new) = old.with_update(update) else {
            return Ok(None);
        };
        if new == old {
            return Ok(None);
        }
        *slot = new;
        if let Feature::WifiSignal(rssi) = new {
            self.health.wifi_signal = Some(rssi);
        }
        Ok(Some((old, new)))
    }
}

/// Step-by-step builder for [`Device`].
#[derive(Debug, Default)]
pub struct DeviceBuilder {
    id: Option<DeviceId>,
    name: Option<String>,
    model: Option<String>,
    features: Vec<Feature>,
    health: Health,
}

impl DeviceBuilder {
    #[must_use]
    pub fn id(mut self, id: DeviceId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    #[must_use]
    pub fn features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features.extend(features);
        self
    }

    #[must_use]
    pub fn health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    /// Consume the builder, validate, and return a [`Device`].
    ///
    /// A missing name falls back to the device id.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Validation`] if the id is missing or any
    /// invariant of [`Device::validate`] fails.
    pub fn build(self) -> Result<Device, BridgeError> {
        let id = self.id.ok_or(ValidationError::EmptyDeviceId)?;
        let mut features = self.features;
        features.sort_by_key(Feature::kind);
        let mut health = self.health;
        if let Some(Feature::WifiSignal(rssi)) = features
            .iter()
            .find(|feature| feature.kind() == FeatureKind::WifiSignal)
        {
            health.wifi_signal = Some(*rssi);
        }
        let device = Device {
            name: self.name.unwrap_or_else(|| id.to_string()),
            model: self.model.unwrap_or_else(|| "Garage Door Opener".to_string()),
            id,
            features,
            health,
        };
        device.validate()?;
        Ok(device)
    }
}
