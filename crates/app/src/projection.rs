//! Projection of model changes onto MQTT topics.
//!
//! MQTT state is a derived view of the capability model. Nothing is
//! published except through this projection.

use serde::Serialize;

use ryobi_gdo2mqtt_domain::device::Device;
use ryobi_gdo2mqtt_domain::feature::{Feature, FeatureKind};
use ryobi_gdo2mqtt_domain::id::DeviceId;
use ryobi_gdo2mqtt_domain::model::CapabilityModel;

use crate::discovery::DiscoveryRegistry;
use crate::dispatcher::CommandReport;
use crate::ports::MqttMessage;
use crate::reconciler::Change;
use crate::topics::{PAYLOAD_OFFLINE, PAYLOAD_ONLINE, TopicMapper, encode_attributes, encode_state};

/// Turns [`Change`]s into MQTT messages and tracks published discovery.
#[derive(Debug, Default)]
pub struct Projector {
    mapper: TopicMapper,
    registry: DiscoveryRegistry,
}

impl Projector {
    #[must_use]
    pub fn new(mapper: TopicMapper) -> Self {
        Self {
            mapper,
            registry: DiscoveryRegistry::new(),
        }
    }

    #[must_use]
    pub fn mapper(&self) -> &TopicMapper {
        &self.mapper
    }

    #[must_use]
    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.registry
    }

    /// Messages for a batch of changes, in order.
    pub fn project(&mut self, model: &CapabilityModel, changes: &[Change]) -> Vec<MqttMessage> {
        let mut out = Vec::new();
        for change in changes {
            match change {
                Change::Discovered(device) => self.announce_device(device, false, &mut out),
                Change::FeatureAdded { device_id, feature } => {
                    if let Some(device) = model.get(device_id) {
                        self.announce_feature(device, feature, false, &mut out);
                    }
                }
                Change::FeatureChanged { device_id, old, new } => {
                    self.push_state_delta(device_id, Some(old), new, &mut out);
                }
                Change::FeatureRemoved { device_id, kind } => {
                    self.retract_feature(device_id, *kind, &mut out);
                }
                Change::WentOffline(device_id) => out.push(self.availability(device_id, false)),
                Change::BackOnline(device_id) => out.push(self.availability(device_id, true)),
                Change::Retracted { device_id, kinds } => {
                    for kind in kinds {
                        self.retract_feature(device_id, *kind, &mut out);
                    }
                    for (kind, record) in self.registry.forget_device(device_id) {
                        tracing::debug!(device_id = %device_id, feature = %kind, "clearing stale discovery");
                        out.push(MqttMessage::retained(record.topic, ""));
                    }
                    out.push(MqttMessage::retained(
                        self.mapper.availability_topic(device_id),
                        "",
                    ));
                }
            }
        }
        out
    }

    /// Re-announce everything, e.g. after Home Assistant restarted.
    pub fn republish_all(&mut self, model: &CapabilityModel) -> Vec<MqttMessage> {
        let mut out = vec![self.bridge_availability(true)];
        for device in model.devices() {
            self.announce_device(device, true, &mut out);
        }
        out
    }

    /// Bridge and per-device availability after the MQTT client (re)connects.
    #[must_use]
    pub fn announce_online(&self, model: &CapabilityModel) -> Vec<MqttMessage> {
        std::iter::once(self.bridge_availability(true))
            .chain(
                model
                    .devices()
                    .map(|device| self.availability(&device.id, device.health.online)),
            )
            .collect()
    }

    /// Everything offline, bridge last.
    #[must_use]
    pub fn shutdown(&self, model: &CapabilityModel) -> Vec<MqttMessage> {
        model
            .ids()
            .map(|device_id| self.availability(device_id, false))
            .chain(std::iter::once(self.bridge_availability(false)))
            .collect()
    }

    #[must_use]
    pub fn availability(&self, device_id: &DeviceId, online: bool) -> MqttMessage {
        MqttMessage::retained(
            self.mapper.availability_topic(device_id),
            if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE },
        )
    }

    #[must_use]
    pub fn bridge_availability(&self, online: bool) -> MqttMessage {
        MqttMessage::retained(
            self.mapper.bridge_status_topic(),
            if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE },
        )
    }

    /// Diagnostic message for a command outcome.
    #[must_use]
    pub fn report(&self, report: &CommandReport) -> Option<MqttMessage> {
        retained_json(self.mapper.diagnostic_topic(&report.device_id), report)
    }

    fn announce_device(&mut self, device: &Device, force: bool, out: &mut Vec<MqttMessage>) {
        for feature in &device.features {
            self.announce_feature(device, feature, force, out);
        }
        out.push(self.availability(&device.id, device.health.online));
    }

    fn announce_feature(
        &mut self,
        device: &Device,
        feature: &Feature,
        force: bool,
        out: &mut Vec<MqttMessage>,
    ) {
        let record = match self.mapper.discovery_for(device, feature) {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(
                    device_id = %device.id,
                    feature = %feature.kind(),
                    error = %err,
                    "cannot encode discovery payload"
                );
                self.push_state_delta(&device.id, None, feature, out);
                return;
            }
        };
        if self
            .registry
            .remember(&device.id, feature.kind(), record.clone())
            || force
        {
            out.push(MqttMessage::retained(record.topic, record.payload));
        }
        self.push_state_delta(&device.id, None, feature, out);
    }

    fn push_state_delta(
        &self,
        device_id: &DeviceId,
        old: Option<&Feature>,
        new: &Feature,
        out: &mut Vec<MqttMessage>,
    ) {
        let kind = new.kind();
        let state = encode_state(new);
        if old.is_none_or(|old| encode_state(old) != state) {
            out.push(MqttMessage::retained(
                self.mapper.state_topic(device_id, kind),
                state,
            ));
        }
        if let Some(attributes) = encode_attributes(new)
            && old.and_then(encode_attributes).as_ref() != Some(&attributes)
        {
            out.push(MqttMessage::retained(
                self.mapper.attributes_topic(device_id, kind),
                attributes,
            ));
        }
    }

    fn retract_feature(&mut self, device_id: &DeviceId, kind: FeatureKind, out: &mut Vec<MqttMessage>) {
        if let Some(record) = self.registry.forget(device_id, kind) {
            out.push(MqttMessage::retained(record.topic, ""));
        }
        out.push(MqttMessage::retained(self.mapper.state_topic(device_id, kind), ""));
        if kind == FeatureKind::Door {
            out.push(MqttMessage::retained(
                self.mapper.attributes_topic(device_id, kind),
                "",
            ));
        }
    }
}

/// Retained JSON message, or nothing if `value` does not serialize.
///
/// An empty retained payload on a discovery topic deletes the Home
/// Assistant entity, so nothing is published in that case.
fn retained_json<T: Serialize>(topic: String, value: &T) -> Option<MqttMessage> {
    match serde_json::to_string(value) {
        Ok(payload) => Some(MqttMessage::retained(topic, payload)),
        Err(err) => {
            tracing::error!(topic = %topic, error = %err, "cannot encode payload");
            None
        }
    }
}
