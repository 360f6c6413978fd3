//! Shared bridge state behind a single lock.
//!
//! The capability model and the pending command table are the only mutable
//! state the two flows share. Every method here is synchronous and returns
//! the messages to publish; callers release the lock before publishing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use ryobi_gdo2mqtt_domain::command::CommandOutcome;
use ryobi_gdo2mqtt_domain::error::BridgeError;
use ryobi_gdo2mqtt_domain::frame::{CloudFrame, CommandAck};
use ryobi_gdo2mqtt_domain::session::SessionState;

use crate::dispatcher::{CommandReport, PendingTable};
use crate::ports::MqttMessage;
use crate::projection::Projector;
use crate::reconciler::Reconciler;

pub type SharedState = Arc<Mutex<BridgeState>>;

/// Lock the shared state, recovering from a poisoned lock.
pub fn lock(state: &SharedState) -> MutexGuard<'_, BridgeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct BridgeState {
    pub reconciler: Reconciler,
    pub pending: PendingTable,
    pub projector: Projector,
}

impl BridgeState {
    #[must_use]
    pub fn new(reconciler: Reconciler, pending: PendingTable, projector: Projector) -> Self {
        Self {
            reconciler,
            pending,
            projector,
        }
    }

    #[must_use]
    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Fold a cloud frame in and resolve the commands it answers.
    pub fn on_frame(&mut self, frame: &CloudFrame, at: Instant) -> Vec<MqttMessage> {
        if let CloudFrame::Ack(ack) = frame {
            return self.on_ack(*ack);
        }
        let changes = match self.reconciler.apply_frame(frame) {
            Ok(changes) => changes,
            Err(err) => {
                tracing::warn!(error = %err, "cloud frame rejected");
                return Vec::new();
            }
        };
        let mut out = self.projector.project(self.reconciler.model(), &changes);
        for command in self.pending.match_changes(&changes, at) {
            out.extend(self.projector.report(&CommandReport::resolved(&command)));
        }
        out
    }

    fn on_ack(&mut self, ack: CommandAck) -> Vec<MqttMessage> {
        let Some(command) = self.pending.acknowledge(ack) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if command.outcome() == Some(CommandOutcome::Acknowledged) {
            tracing::info!(command_id = %command.id, "command acknowledged");
            if let Some(update) = command.command.optimistic_update() {
                match self.reconciler.apply_optimistic(&command.device_id, update) {
                    Ok(changes) => {
                        out.extend(self.projector.project(self.reconciler.model(), &changes));
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "skipping optimistic update");
                    }
                }
            }
        } else {
            tracing::warn!(command_id = %command.id, "command rejected by the cloud");
        }
        out.extend(self.projector.report(&CommandReport::resolved(&command)));
        out
    }

    /// React to a cloud session transition.
    pub fn on_session_state(&mut self, state: SessionState) -> Vec<MqttMessage> {
        match state {
            SessionState::Degraded | SessionState::Disconnected | SessionState::Closed => {
                let changes = self.reconciler.mark_all_offline();
                self.projector.project(self.reconciler.model(), &changes)
            }
            SessionState::Authenticating | SessionState::Connected => Vec::new(),
        }
    }

    /// Time out overdue commands.
    pub fn expire_commands(&mut self, at: Instant) -> Vec<MqttMessage> {
        self.pending
            .expire(at)
            .iter()
            .filter_map(|command| self.projector.report(&CommandReport::resolved(command)))
            .collect()
    }

    /// Diagnostic for a command refused before it reached the cloud.
    #[must_use]
    pub fn refusal(&self, topic: &str, payload: &str, err: &BridgeError) -> Option<MqttMessage> {
        let (device_id, kind) = self.projector.mapper().parse_command_topic(topic).ok()?;
        self.projector
            .report(&CommandReport::refused(device_id, kind, payload, err))
    }

    /// Home Assistant came online: announce everything again.
    pub fn republish(&mut self) -> Vec<MqttMessage> {
        self.projector.republish_all(self.reconciler.model())
    }

    /// The MQTT client (re)connected.
    #[must_use]
    pub fn announce_online(&self) -> Vec<MqttMessage> {
        self.projector.announce_online(self.reconciler.model())
    }

    /// Final messages: outstanding commands time out, everything goes offline.
    pub fn shutdown(&mut self) -> Vec<MqttMessage> {
        let mut out: Vec<MqttMessage> = self
            .pending
            .abandon_all()
            .iter()
            .filter_map(|command| self.projector.report(&CommandReport::resolved(command)))
            .collect();
        out.extend(self.projector.shutdown(self.reconciler.model()));
        out
    }
}
