//! Cloud port: the vendor session as seen by the engine.
//!
//! The adapter owns authentication, heartbeat and reconnects. The engine
//! only sends validated commands and reads a restartable stream of
//! [`SessionEvent`]s.

use std::future::Future;

use ryobi_gdo2mqtt_domain::command::OutboundCommand;
use ryobi_gdo2mqtt_domain::error::{AuthError, BridgeError};
use ryobi_gdo2mqtt_domain::frame::CloudFrame;
use ryobi_gdo2mqtt_domain::session::SessionState;

/// Something that happened on the cloud side.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A decoded vendor frame.
    Frame(CloudFrame),
    /// The session moved to a new state.
    StateChanged(SessionState),
    /// Re-authentication was refused. The session will not retry.
    Fatal(AuthError),
}

/// Outbound half of the cloud session.
pub trait CloudSession: Send + Sync {
    /// Transmit a validated command frame.
    ///
    /// Fails with [`BridgeError::SessionClosed`] when no session is live.
    fn send(
        &self,
        command: OutboundCommand,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;

    /// Close the session for good. Further sends fail with `SessionClosed`.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

impl<T: CloudSession> CloudSession for std::sync::Arc<T> {
    fn send(
        &self,
        command: OutboundCommand,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        (**self).send(command)
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        (**self).close()
    }
}

/// Inbound half of the cloud session.
pub trait FrameSource: Send {
    /// Wait for the next event. `None` once the session is closed.
    fn next_event(&mut self) -> impl Future<Output = Option<SessionEvent>> + Send;
}
