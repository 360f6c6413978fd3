//! State reconciler: folds cloud frames into the capability model.
//!
//! Every frame produces the list of [`Change`]s that are actually visible.
//! A delta that leaves a feature at its current value yields nothing, so
//! MQTT traffic follows real-world changes and not vendor chattiness.

use std::collections::{BTreeSet, HashMap};

use ryobi_gdo2mqtt_domain::device::Device;
use ryobi_gdo2mqtt_domain::error::{BridgeError, NotFoundError};
use ryobi_gdo2mqtt_domain::feature::{Feature, FeatureKind, FeatureUpdate};
use ryobi_gdo2mqtt_domain::frame::{CloudFrame, DeviceDelta};
use ryobi_gdo2mqtt_domain::id::DeviceId;
use ryobi_gdo2mqtt_domain::model::CapabilityModel;
use ryobi_gdo2mqtt_domain::time::{Timestamp, now};

/// An observable change to the capability model.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A device seen for the first time, or whose identity changed.
    Discovered(Device),
    FeatureAdded {
        device_id: DeviceId,
        feature: Feature,
    },
    FeatureChanged {
        device_id: DeviceId,
        old: Feature,
        new: Feature,
    },
    FeatureRemoved {
        device_id: DeviceId,
        kind: FeatureKind,
    },
    WentOffline(DeviceId),
    BackOnline(DeviceId),
    /// The device was forgotten; its topics must be cleared.
    Retracted {
        device_id: DeviceId,
        kinds: Vec<FeatureKind>,
    },
}

/// Omission thresholds for devices missing from snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Consecutive snapshot omissions before a device is marked offline.
    pub offline_after_misses: u32,
    /// Consecutive snapshot omissions before a device is forgotten.
    pub forget_after_misses: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            offline_after_misses: 2,
            forget_after_misses: 5,
        }
    }
}

/// Owns the [`CapabilityModel`] and is the only writer to it.
#[derive(Debug, Default)]
pub struct Reconciler {
    model: CapabilityModel,
    misses: HashMap<DeviceId, u32>,
    config: ReconcilerConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(config: ReconcilerConfig) -> Self {
        let offline_after_misses = config.offline_after_misses.max(1);
        Self {
            model: CapabilityModel::new(),
            misses: HashMap::new(),
            config: ReconcilerConfig {
                offline_after_misses,
                forget_after_misses: config.forget_after_misses.max(offline_after_misses),
            },
        }
    }

    /// Read-only view of the current state.
    #[must_use]
    pub fn model(&self) -> &CapabilityModel {
        &self.model
    }

    /// Fold one cloud frame into the model.
    ///
    /// Acknowledgment frames carry no state and yield no change.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotFound`] for a delta that references a device
    /// never seen in a snapshot.
    #[tracing::instrument(skip_all)]
    pub fn apply_frame(&mut self, frame: &CloudFrame) -> Result<Vec<Change>, BridgeError> {
        match frame {
            CloudFrame::Snapshot(devices) => Ok(self.apply_snapshot(devices, now())),
            CloudFrame::Delta(delta) => self.apply_delta(delta),
            CloudFrame::Ack(_) => Ok(Vec::new()),
        }
    }

    fn apply_snapshot(&mut self, devices: &[Device], at: Timestamp) -> Vec<Change> {
        let mut changes = Vec::new();
        let mut seen = BTreeSet::new();

        for incoming in devices {
            seen.insert(incoming.id.clone());
            self.misses.remove(&incoming.id);

            let mut fresh = incoming.clone();
            fresh.health.online = true;
            fresh.health.last_seen = Some(at);

            match self.model.get(&fresh.id) {
                None => {
                    tracing::info!(device_id = %fresh.id, name = %fresh.name, "device discovered");
                    changes.push(Change::Discovered(fresh.clone()));
                }
                Some(known) => {
                    let renamed = known.name != fresh.name || known.model != fresh.model;
                    diff_features(known, &fresh, !renamed, &mut changes);
                    if renamed {
                        changes.push(Change::Discovered(fresh.clone()));
                    } else if !known.health.online {
                        tracing::info!(device_id = %fresh.id, "device back online");
                        changes.push(Change::BackOnline(fresh.id.clone()));
                    }
                }
            }
            self.model.insert(fresh);
        }

        let missing: Vec<DeviceId> = self
            .model
            .ids()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for device_id in missing {
            self.record_miss(device_id, &mut changes);
        }

        changes
    }

    fn record_miss(&mut self, device_id: DeviceId, changes: &mut Vec<Change>) {
        let count = self.misses.entry(device_id.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        if count >= self.config.forget_after_misses {
            self.misses.remove(&device_id);
            if let Some(device) = self.model.remove(&device_id) {
                tracing::warn!(device_id = %device_id, misses = count, "device forgotten");
                changes.push(Change::Retracted {
                    device_id,
                    kinds: device.feature_kinds().collect(),
                });
            }
        } else if count >= self.config.offline_after_misses {
            if let Some(device) = self.model.get_mut(&device_id)
                && device.health.online
            {
                device.health.online = false;
                tracing::warn!(device_id = %device_id, misses = count, "device missing from snapshots, marking offline");
                changes.push(Change::WentOffline(device_id));
            }
        } else {
            tracing::debug!(device_id = %device_id, misses = count, "device missing from snapshot");
        }
    }

    fn apply_delta(&mut self, delta: &DeviceDelta) -> Result<Vec<Change>, BridgeError> {
        let Some(device) = self.model.get_mut(&delta.device_id) else {
            tracing::warn!(
                device_id = %delta.device_id,
                "rejecting delta for a device never seen in a snapshot"
            );
            return Err(NotFoundError {
                entity: "Device",
                id: delta.device_id.to_string(),
            }
            .into());
        };

        let mut changes = Vec::new();
        device.health.last_seen = Some(delta.received_at);
        if !device.health.online {
            device.health.online = true;
            self.misses.remove(&delta.device_id);
            changes.push(Change::BackOnline(delta.device_id.clone()));
        }

        for update in &delta.updates {
            if device
                .feature(update.kind())
                .is_some_and(|feature| feature.clamps(*update))
            {
                tracing::debug!(
                    device_id = %delta.device_id,
                    update = ?update,
                    "vendor value out of range, clamping"
                );
            }
            match device.apply_update(*update) {
                Ok(Some((old, new))) => {
                    push_feature_change(&mut changes, &delta.device_id, old, new);
                }
                Ok(None) => {
                    tracing::trace!(device_id = %delta.device_id, feature = %update.kind(), "no visible change");
                }
                Err(err) => {
                    tracing::debug!(error = %err, "ignoring update for a feature that is not installed");
                }
            }
        }
        Ok(changes)
    }

    /// Apply the state assumed after an acknowledged command.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotFound`] if the device was forgotten, or
    /// [`BridgeError::UnsupportedFeature`] if the feature is not installed.
    pub fn apply_optimistic(
        &mut self,
        device_id: &DeviceId,
        update: FeatureUpdate,
    ) -> Result<Vec<Change>, BridgeError> {
        let device = self.model.get_mut(device_id).ok_or_else(|| NotFoundError {
            entity: "Device",
            id: device_id.to_string(),
        })?;
        let mut changes = Vec::new();
        if let Some((old, new)) = device.apply_update(update)? {
            changes.push(Change::FeatureChanged {
                device_id: device_id.clone(),
                old,
                new,
            });
        }
        Ok(changes)
    }

    /// Mark every online device offline, e.g. when the cloud link drops.
    pub fn mark_all_offline(&mut self) -> Vec<Change> {
        self.model
            .devices_mut()
            .filter(|device| device.health.online)
            .map(|device| {
                device.health.online = false;
                Change::WentOffline(device.id.clone())
            })
            .collect()
    }
}

fn diff_features(known: &Device, fresh: &Device, report_values: bool, changes: &mut Vec<Change>) {
    for kind in known.feature_kinds() {
        if !fresh.has_feature(kind) {
            changes.push(Change::FeatureRemoved {
                device_id: fresh.id.clone(),
                kind,
            });
        }
    }
    if !report_values {
        return;
    }
    for feature in &fresh.features {
        match known.feature(feature.kind()) {
            None => changes.push(Change::FeatureAdded {
                device_id: fresh.id.clone(),
                feature: *feature,
            }),
            Some(old) if old != feature => changes.push(Change::FeatureChanged {
                device_id: fresh.id.clone(),
                old: *old,
                new: *feature,
            }),
            Some(_) => {}
        }
    }
}

/// Coalesce successive updates to the same feature within one delta.
fn push_feature_change(changes: &mut Vec<Change>, device_id: &DeviceId, old: Feature, new: Feature) {
    let kind = new.kind();
    let earlier = changes.iter().position(|change| {
        matches!(change, Change::FeatureChanged { new: previous, .. } if previous.kind() == kind)
    });
    let Some(index) = earlier else {
        changes.push(Change::FeatureChanged {
            device_id: device_id.clone(),
            old,
            new,
        });
        return;
    };
    let unchanged = match &mut changes[index] {
        Change::FeatureChanged {
            old: first,
            new: last,
            ..
        } => {
            *last = new;
            *first == new
        }
        _ => false,
    };
    if unchanged {
        changes.remove(index);
    }
}
