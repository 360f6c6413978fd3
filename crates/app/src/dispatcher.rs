//! Command dispatcher: relays Home Assistant commands to the cloud.
//!
//! Each accepted command becomes a [`PendingCommand`] that resolves exactly
//! once:
//!
//! - **Acknowledged** when the cloud echoes the command id, or, failing
//!   that, when a state change matching the command is observed within the
//!   match window
//! - **Rejected** when the cloud answers the command id with an error
//! - **`TimedOut`** when neither happens before the acknowledgment timeout
//!
//! A resolved command leaves the table, so late acknowledgments are
//! ignored and nothing is ever re-sent.

use std::collections::HashMap;
use std::error::Error as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use ryobi_gdo2mqtt_domain::command::{CommandOutcome, PendingCommand};
use ryobi_gdo2mqtt_domain::error::{BridgeError, UnsupportedFeatureError};
use ryobi_gdo2mqtt_domain::feature::FeatureKind;
use ryobi_gdo2mqtt_domain::frame::CommandAck;
use ryobi_gdo2mqtt_domain::id::{CommandId, DeviceId};
use ryobi_gdo2mqtt_domain::time::{Timestamp, now};

use crate::ports::CloudSession;
use crate::reconciler::Change;
use crate::state::{SharedState, lock};
use crate::topics::{TopicMapper, decode_command};

/// Acknowledgment timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How long a command may stay unacknowledged.
    pub ack_timeout: Duration,
    /// How long after sending a matching state change counts as an
    /// acknowledgment.
    pub match_window: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            match_window: Duration::from_secs(10),
        }
    }
}

/// Outcome of a command as published on the diagnostic topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReport {
    pub device_id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<FeatureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: Timestamp,
}

impl CommandReport {
    /// Report for a resolved command.
    #[must_use]
    pub fn resolved(command: &PendingCommand) -> Self {
        Self {
            device_id: command.device_id.clone(),
            command_id: Some(command.id),
            feature: Some(command.command.kind()),
            value: Some(command.command.value_label()),
            outcome: command.outcome().map_or("pending", CommandOutcome::as_str),
            error: None,
            at: now(),
        }
    }

    /// Report for a command refused before reaching the cloud.
    #[must_use]
    pub fn refused(
        device_id: DeviceId,
        feature: FeatureKind,
        payload: &str,
        err: &BridgeError,
    ) -> Self {
        Self {
            device_id,
            command_id: None,
            feature: Some(feature),
            value: Some(payload.to_string()),
            outcome: err.code(),
            error: Some(describe(err)),
            at: now(),
        }
    }
}

fn describe(err: &BridgeError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug)]
struct Tracked {
    command: PendingCommand,
    sent_at: Instant,
}

/// Commands sent and not yet resolved.
#[derive(Debug, Default)]
pub struct PendingTable {
    commands: HashMap<CommandId, Tracked>,
    config: DispatcherConfig,
}

impl PendingTable {
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            commands: HashMap::new(),
            config,
        }
    }

    pub fn insert(&mut self, command: PendingCommand, sent_at: Instant) {
        self.commands
            .insert(command.id, Tracked { command, sent_at });
    }

    pub fn remove(&mut self, id: &CommandId) -> Option<PendingCommand> {
        self.commands.remove(id).map(|tracked| tracked.command)
    }

    #[must_use]
    pub fn get(&self, id: &CommandId) -> Option<&PendingCommand> {
        self.commands.get(id).map(|tracked| &tracked.command)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Resolve the command the cloud replied to.
    ///
    /// Returns `None` for an id that is unknown or already resolved.
    pub fn acknowledge(&mut self, ack: CommandAck) -> Option<PendingCommand> {
        let Some(command) = self.remove(&ack.command_id) else {
            tracing::debug!(command_id = %ack.command_id, "ignoring reply for unknown or resolved command");
            return None;
        };
        let outcome = if ack.accepted {
            CommandOutcome::Acknowledged
        } else {
            CommandOutcome::Rejected
        };
        Some(settle(command, outcome))
    }

    /// Resolve commands whose effect shows up in `changes`.
    ///
    /// For each changed feature the oldest matching command inside the
    /// match window is acknowledged.
    pub fn match_changes(&mut self, changes: &[Change], at: Instant) -> Vec<PendingCommand> {
        let mut resolved = Vec::new();
        for change in changes {
            let Change::FeatureChanged { device_id, new, .. } = change else {
                continue;
            };
            let candidate = self
                .commands
                .values()
                .filter(|tracked| {
                    &tracked.command.device_id == device_id
                        && at.saturating_duration_since(tracked.sent_at) <= self.config.match_window
                        && tracked.command.command.is_satisfied_by(new)
                })
                .min_by_key(|tracked| tracked.sent_at)
                .map(|tracked| tracked.command.id);
            if let Some(command) = candidate.and_then(|id| self.remove(&id)) {
                tracing::debug!(command_id = %command.id, "command acknowledged by matching state change");
                resolved.push(settle(command, CommandOutcome::Acknowledged));
            }
        }
        resolved
    }

    /// Resolve every command older than the acknowledgment timeout.
    pub fn expire(&mut self, at: Instant) -> Vec<PendingCommand> {
        let timeout = self.config.ack_timeout;
        let expired: Vec<CommandId> = self
            .commands
            .values()
            .filter(|tracked| at.saturating_duration_since(tracked.sent_at) >= timeout)
            .map(|tracked| tracked.command.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .map(|command| {
                tracing::warn!(
                    command_id = %command.id,
                    device_id = %command.device_id,
                    feature = %command.command.kind(),
                    "command timed out"
                );
                settle(command, CommandOutcome::TimedOut)
            })
            .collect()
    }

    /// Resolve everything still in flight as timed out.
    pub fn abandon_all(&mut self) -> Vec<PendingCommand> {
        self.commands
            .drain()
            .map(|(_, tracked)| settle(tracked.command, CommandOutcome::TimedOut))
            .collect()
    }
}

fn settle(mut command: PendingCommand, outcome: CommandOutcome) -> PendingCommand {
    if let Err(err) = command.resolve(outcome) {
        tracing::warn!(error = %err, "command resolved twice");
    }
    command
}

/// Turns inbound `set` messages into cloud commands.
pub struct CommandDispatcher<S> {
    session: S,
    state: SharedState,
    mapper: TopicMapper,
    accepting: AtomicBool,
}

impl<S: CloudSession> CommandDispatcher<S> {
    pub fn new(session: S, state: SharedState, mapper: TopicMapper) -> Self {
        Self {
            session,
            state,
            mapper,
            accepting: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn mapper(&self) -> &TopicMapper {
        &self.mapper
    }

    /// Refuse every further command with [`BridgeError::SessionClosed`].
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Close the underlying cloud session.
    pub async fn close_session(&self) {
        self.session.close().await;
    }

    /// Validate a command against the capability model and send it.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::InvalidCommand`] for an unknown topic or a payload
    ///   outside the feature's grammar
    /// - [`BridgeError::NotFound`] for an unknown device
    /// - [`BridgeError::UnsupportedFeature`] when the feature is not installed
    /// - [`BridgeError::SessionClosed`] / [`BridgeError::Network`] from the
    ///   cloud session, in which case no pending command is kept
    #[tracing::instrument(skip(self, payload))]
    pub async fn handle_command(&self, topic: &str, payload: &str) -> Result<CommandId, BridgeError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BridgeError::SessionClosed);
        }
        let (device_id, kind) = self.mapper.parse_command_topic(topic)?;

        let outbound = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let device = state.reconciler.model().require(&device_id)?;
            let installed = device
                .feature(kind)
                .ok_or_else(|| UnsupportedFeatureError {
                    device_id: device_id.clone(),
                    feature: kind,
                })?;
            let command = decode_command(installed, payload)?;
            let pending = PendingCommand::new(device_id, command, now());
            let outbound = pending.to_outbound();
            state.pending.insert(pending, Instant::now());
            outbound
        };

        let id = outbound.id;
        tracing::info!(
            command_id = %id,
            device_id = %outbound.device_id,
            feature = %outbound.feature,
            value = %outbound.value,
            "sending command"
        );
        if let Err(err) = self.session.send(outbound).await {
            lock(&self.state).pending.remove(&id);
            tracing::warn!(command_id = %id, error = %err, "command not sent");
            return Err(err);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Mutex;

    use ryobi_gdo2mqtt_domain::command::{Command, DoorCommand, OutboundCommand};
    use ryobi_gdo2mqtt_domain::device::Device;
    use ryobi_gdo2mqtt_domain::error::InvalidCommandError;
    use ryobi_gdo2mqtt_domain::feature::{DoorState, DoorStatus, Feature};
    use ryobi_gdo2mqtt_domain::frame::CloudFrame;

    #[derive(Default)]
    struct RecordingSession {
        sent: Mutex<Vec<OutboundCommand>>,
        offline: bool,
    }

    impl CloudSession for RecordingSession {
        fn send(
            &self,
            command: OutboundCommand,
        ) -> impl Future<Output = Result<(), BridgeError>> + Send {
            let result = if self.offline {
                Err(BridgeError::SessionClosed)
            } else {
                self.sent.lock().unwrap().push(command);
                Ok(())
            };
            async move { result }
        }

        fn close(&self) -> impl Future<Output = ()> + Send {
            async {}
        }
    }

    fn id() -> DeviceId {
        DeviceId::new("gdo1").unwrap()
    }

    fn door(state: DoorState) -> Feature {
        Feature::Door(DoorStatus {
            state,
            obstructed: false,
        })
    }

    fn state_with(features: Vec<Feature>) -> SharedState {
        let state = SharedState::default();
        let device = Device::builder()
            .id(id())
            .name("Garage")
            .features(features)
            .build()
            .unwrap();
        lock(&state)
            .reconciler
            .apply_frame(&CloudFrame::Snapshot(vec![device]))
            .unwrap();
        state
    }

    fn dispatcher(session: RecordingSession, state: &SharedState) -> CommandDispatcher<RecordingSession> {
        CommandDispatcher::new(session, state.clone(), TopicMapper::default())
    }

    #[tokio::test]
    async fn should_send_door_command_and_track_it() {
        let state = state_with(vec![door(DoorState::Closed)]);
        let dispatcher = dispatcher(RecordingSession::default(), &state);

        let command_id = dispatcher
            .handle_command("ryobi_gdo_2_mqtt/gdo1/door/set", "OPEN")
            .await
            .unwrap();

        let sent = dispatcher.session.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            serde_json::to_value(&sent[0]).unwrap(),
            serde_json::json!({"deviceId": "gdo1", "feature": "door", "value": "OPEN"})
        );
        assert_eq!(sent[0].id, command_id);
        assert!(lock(&state).pending.get(&command_id).is_some());
    }

    #[tokio::test]
    async fn should_reject_command_for_missing_feature_without_sending() {
        let state = state_with(vec![Feature::Light(false)]);
        let dispatcher = dispatcher(RecordingSession::default(), &state);

        let result = dispatcher
            .handle_command("ryobi_gdo_2_mqtt/gdo1/door/set", "OPEN")
            .await;

        assert!(matches!(result, Err(BridgeError::UnsupportedFeature(_))));
        assert!(dispatcher.session.sent.lock().unwrap().is_empty());
        assert!(lock(&state).pending.is_empty());
    }

    #[tokio::test]
    async fn should_reject_command_for_unknown_device() {
        let state = state_with(vec![door(DoorState::Closed)]);
        let dispatcher = dispatcher(RecordingSession::default(), &state);

        let result = dispatcher
            .handle_command("ryobi_gdo_2_mqtt/ghost/door/set", "OPEN")
            .await;

        assert!(matches!(result, Err(BridgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn should_reject_payload_outside_grammar() {
        let state = state_with(vec![door(DoorState::Closed)]);
        let dispatcher = dispatcher(RecordingSession::default(), &state);

        let result = dispatcher
            .handle_command("ryobi_gdo_2_mqtt/gdo1/door/set", "TOGGLE")
            .await;

        assert!(matches!(
            result,
            Err(BridgeError::InvalidCommand(InvalidCommandError::Payload { .. }))
        ));
        assert!(dispatcher.session.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_drop_pending_command_when_session_is_closed() {
        let state = state_with(vec![door(DoorState::Closed)]);
        let session = RecordingSession {
            offline: true,
            ..RecordingSession::default()
        };
        let dispatcher = dispatcher(session, &state);

        let result = dispatcher
            .handle_command("ryobi_gdo_2_mqtt/gdo1/door/set", "OPEN")
            .await;

        assert!(matches!(result, Err(BridgeError::SessionClosed)));
        assert!(lock(&state).pending.is_empty());
    }

    #[tokio::test]
    async fn should_refuse_commands_after_stop() {
        let state = state_with(vec![door(DoorState::Closed)]);
        let dispatcher = dispatcher(RecordingSession::default(), &state);
        dispatcher.stop_accepting();

        let result = dispatcher
            .handle_command("ryobi_gdo_2_mqtt/gdo1/door/set", "OPEN")
            .await;

        assert!(matches!(result, Err(BridgeError::SessionClosed)));
        assert!(dispatcher.session.sent.lock().unwrap().is_empty());
    }

    fn pending(command: Command) -> PendingCommand {
        PendingCommand::new(id(), command, now())
    }

    #[test]
    fn should_acknowledge_by_command_id() {
        let mut table = PendingTable::default();
        let cmd = pending(Command::Door(DoorCommand::Open));
        let command_id = cmd.id;
        table.insert(cmd, Instant::now());

        let resolved = table
            .acknowledge(CommandAck {
                command_id,
                accepted: true,
            })
            .unwrap();

        assert_eq!(resolved.outcome(), Some(CommandOutcome::Acknowledged));
        assert!(table.is_empty());
    }

    #[test]
    fn should_mark_rejected_reply() {
        let mut table = PendingTable::default();
        let cmd = pending(Command::Light(true));
        let command_id = cmd.id;
        table.insert(cmd, Instant::now());

        let resolved = table
            .acknowledge(CommandAck {
                command_id,
                accepted: false,
            })
            .unwrap();
        assert_eq!(resolved.outcome(), Some(CommandOutcome::Rejected));
    }

    #[test]
    fn should_never_acknowledge_after_timeout() {
        let mut table = PendingTable::default();
        let cmd = pending(Command::Door(DoorCommand::Open));
        let command_id = cmd.id;
        let sent_at = Instant::now();
        table.insert(cmd, sent_at);

        assert!(table.expire(sent_at + Duration::from_secs(9)).is_empty());
        let expired = table.expire(sent_at + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].outcome(), Some(CommandOutcome::TimedOut));

        let late = table.acknowledge(CommandAck {
            command_id,
            accepted: true,
        });
        assert!(late.is_none());

        let change = Change::FeatureChanged {
            device_id: id(),
            old: door(DoorState::Closed),
            new: door(DoorState::Opening),
        };
        assert!(table
            .match_changes(&[change], sent_at + Duration::from_secs(11))
            .is_empty());
    }

    #[test]
    fn should_acknowledge_by_matching_state_change_within_window() {
        let mut table = PendingTable::default();
        let sent_at = Instant::now();
        table.insert(pending(Command::Door(DoorCommand::Open)), sent_at);
        table.insert(pending(Command::Light(true)), sent_at);

        let changes = [Change::FeatureChanged {
            device_id: id(),
            old: door(DoorState::Closed),
            new: door(DoorState::Opening),
        }];
        let resolved = table.match_changes(&changes, sent_at + Duration::from_secs(2));

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].command, Command::Door(DoorCommand::Open));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn should_ignore_matching_change_outside_window() {
        let mut table = PendingTable::new(DispatcherConfig {
            ack_timeout: Duration::from_secs(30),
            match_window: Duration::from_secs(5),
        });
        let sent_at = Instant::now();
        table.insert(pending(Command::Light(true)), sent_at);

        let changes = [Change::FeatureChanged {
            device_id: id(),
            old: Feature::Light(false),
            new: Feature::Light(true),
        }];
        assert!(table
            .match_changes(&changes, sent_at + Duration::from_secs(6))
            .is_empty());
    }

    #[test]
    fn should_describe_refused_command() {
        let err: BridgeError = InvalidCommandError::ReadOnly(FeatureKind::Battery).into();
        let report = CommandReport::refused(id(), FeatureKind::Battery, "50", &err);
        assert_eq!(report.outcome, "invalid_command");
        assert_eq!(report.error.as_deref(), Some("invalid command: battery is read-only"));
    }

    #[test]
    fn should_report_timed_out_outcome() {
        let mut table = PendingTable::default();
        table.insert(pending(Command::Fan(2)), Instant::now());
        let abandoned = table.abandon_all();
        let report = CommandReport::resolved(&abandoned[0]);
        assert_eq!(report.outcome, "timed_out");
        assert_eq!(report.value.as_deref(), Some("2"));
    }
}
