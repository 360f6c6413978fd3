//! Cloud session manager.
//!
//! [`SessionManager::connect`] authenticates, opens the socket, subscribes
//! every bridged device, fetches the snapshot and hands back two halves:
//!
//! - [`SessionHandle`] sends commands and closes the session
//! - [`SessionEvents`] yields snapshots, deltas, acknowledgments and state
//!   changes
//!
//! A background worker then owns the socket. It pings on a fixed interval
//! and drops the socket when a ping stays unanswered (`Degraded`). Whenever
//! the socket is lost it reconnects with exponential backoff, forever,
//! and every successful reconnect emits a fresh snapshot. Only a refused
//! login ends the worker on its own.
//!
//! The snapshot is fetched after the subscriptions are in place. Frames the
//! socket delivers meanwhile are held back and replayed right after the
//! snapshot, so a change made during a resync is never lost.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ryobi_gdo2mqtt_app::ports::{CloudSession, FrameSource, SessionEvent};
use ryobi_gdo2mqtt_domain::command::OutboundCommand;
use ryobi_gdo2mqtt_domain::error::{AuthError, BridgeError};
use ryobi_gdo2mqtt_domain::frame::{CloudFrame, CommandAck};
use ryobi_gdo2mqtt_domain::id::{CommandId, DeviceId};
use ryobi_gdo2mqtt_domain::session::{AuthToken, SessionState};
use ryobi_gdo2mqtt_domain::time::now;

use crate::backoff::Backoff;
use crate::codec::{self, Inbound, ModuleIndex};
use crate::config::CloudConfig;
use crate::error::CloudError;
use crate::transport::{Connection, Connector, Incoming, Snapshot};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 32;
const MAX_IN_FLIGHT: usize = 256;

struct Request {
    command: OutboundCommand,
    reply: oneshot::Sender<Result<(), BridgeError>>,
}

/// Why a live connection ended.
enum Exit {
    Shutdown,
    HeartbeatMissed,
    Dropped(CloudError),
}

/// A live, subscribed socket and the state fetched behind it.
struct Established<N> {
    connection: N,
    snapshot: Snapshot,
    /// Frames that arrived while the snapshot was being fetched.
    backlog: Vec<String>,
}

/// Builds a cloud session from a [`Connector`].
pub struct SessionManager<C> {
    connector: C,
    config: CloudConfig,
}

impl<C: Connector> SessionManager<C> {
    #[must_use]
    pub fn new(connector: C, config: CloudConfig) -> Self {
        Self { connector, config }
    }

    /// Establish the first session and start supervising it.
    ///
    /// # Errors
    ///
    /// - [`CloudError::Unauthorized`] when the credentials are refused
    /// - any transport error of the first attempt; later failures are
    ///   retried by the worker and never surface here
    pub async fn connect(self) -> Result<(SessionHandle, SessionEvents), CloudError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let mut worker = Worker {
            connector: self.connector,
            config: self.config,
            events: events_tx,
            state: state_tx,
            token: None,
            modules: ModuleIndex::default(),
            in_flight: BTreeMap::new(),
            next_id: 0,
        };

        worker.set_state(SessionState::Authenticating).await;
        let Established {
            connection,
            snapshot,
            backlog,
        } = match worker.establish().await {
            Ok(established) => established,
            Err(err) => {
                worker.set_state(SessionState::Disconnected).await;
                return Err(err);
            }
        };
        worker.connected(snapshot, backlog).await;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();
        let task = tokio::spawn(worker.run(connection, commands_rx, stop.clone()));

        Ok((
            SessionHandle {
                commands: commands_tx,
                state: state_rx,
                stop,
                task: Mutex::new(Some(task)),
            },
            SessionEvents { events: events_rx },
        ))
    }
}

/// Sending half of the session.
pub struct SessionHandle {
    commands: mpsc::Sender<Request>,
    state: watch::Receiver<SessionState>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

impl CloudSession for SessionHandle {
    fn send(
        &self,
        command: OutboundCommand,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        async move {
            let live = self.state.borrow().is_live();
            if !live {
                return Err(BridgeError::SessionClosed);
            }
            let (reply, response) = oneshot::channel();
            self.commands
                .send(Request { command, reply })
                .await
                .map_err(|_| BridgeError::SessionClosed)?;
            response.await.unwrap_or(Err(BridgeError::SessionClosed))
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            self.stop.cancel();
            let task = self
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(task) = task
                && let Err(err) = task.await
            {
                tracing::warn!(error = %err, "cloud session worker ended abnormally");
            }
        }
    }
}

/// Receiving half of the session.
pub struct SessionEvents {
    events: mpsc::Receiver<SessionEvent>,
}

impl FrameSource for SessionEvents {
    fn next_event(&mut self) -> impl Future<Output = Option<SessionEvent>> + Send {
        self.events.recv()
    }
}

struct Worker<C> {
    connector: C,
    config: CloudConfig,
    events: mpsc::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
    token: Option<AuthToken>,
    modules: ModuleIndex,
    /// JSON-RPC request id of each command awaiting its reply.
    in_flight: BTreeMap<u64, CommandId>,
    next_id: u64,
}

impl<C: Connector> Worker<C> {
    async fn run(
        mut self,
        mut connection: C::Connection,
        mut commands: mpsc::Receiver<Request>,
        stop: CancellationToken,
    ) {
        loop {
            match self.pump(&mut connection, &mut commands, &stop).await {
                Exit::Shutdown => {
                    connection.close().await;
                    break;
                }
                Exit::HeartbeatMissed => {
                    tracing::warn!(
                        timeout_secs = self.config.heartbeat_timeout().as_secs(),
                        "cloud heartbeat missed"
                    );
                    self.set_state(SessionState::Degraded).await;
                    connection.close().await;
                }
                Exit::Dropped(err) => {
                    tracing::warn!(error = %err, "cloud connection lost");
                }
            }
            self.in_flight.clear();
            self.set_state(SessionState::Disconnected).await;

            match self.reconnect(&mut commands, &stop).await {
                Some(next) => connection = next,
                None => break,
            }
        }
        self.set_state(SessionState::Closed).await;
        tracing::info!("cloud session closed");
    }

    /// Serve one live connection until it ends.
    async fn pump(
        &mut self,
        connection: &mut C::Connection,
        commands: &mut mpsc::Receiver<Request>,
        stop: &CancellationToken,
    ) -> Exit {
        let interval = self.config.heartbeat_interval();
        let timeout = self.config.heartbeat_timeout();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => return Exit::Shutdown,
                request = commands.recv() => {
                    let Some(request) = request else {
                        return Exit::Shutdown;
                    };
                    if let Err(err) = self.transmit(connection, request).await {
                        return Exit::Dropped(err);
                    }
                }
                incoming = connection.recv() => match incoming {
                    None => return Exit::Dropped(CloudError::Closed),
                    Some(Err(err)) => return Exit::Dropped(err),
                    Some(Ok(Incoming::Pong)) => deadline = None,
                    Some(Ok(Incoming::Text(text))) => {
                        deadline = None;
                        self.dispatch(&text).await;
                    }
                },
                _ = heartbeat.tick() => {
                    if deadline.is_none() {
                        if let Err(err) = connection.ping().await {
                            return Exit::Dropped(err);
                        }
                        deadline = Some(Instant::now() + timeout);
                    }
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Exit::HeartbeatMissed;
                }
            }
        }
    }

    /// Retry until a session is back, the login is refused, or shutdown.
    async fn reconnect(
        &mut self,
        commands: &mut mpsc::Receiver<Request>,
        stop: &CancellationToken,
    ) -> Option<C::Connection> {
        let mut backoff = Backoff::new(self.config.reconnect_initial(), self.config.reconnect_max());
        loop {
            let delay = backoff.next_delay();
            tracing::info!(
                attempt = backoff.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting to the cloud"
            );
            if !refuse_while_waiting(delay, commands, stop).await {
                return None;
            }

            self.set_state(SessionState::Authenticating).await;
            let result = tokio::select! {
                biased;
                () = stop.cancelled() => return None,
                result = self.establish() => result,
            };
            match result {
                Ok(Established {
                    connection,
                    snapshot,
                    backlog,
                }) => {
                    tracing::info!(attempt = backoff.attempt(), "cloud session re-established");
                    self.connected(snapshot, backlog).await;
                    return Some(connection);
                }
                Err(CloudError::Unauthorized(reason)) => {
                    tracing::error!(reason = %reason, "cloud refused re-authentication");
                    self.emit(SessionEvent::Fatal(AuthError { reason })).await;
                    return None;
                }
                Err(err) => {
                    tracing::warn!(attempt = backoff.attempt(), error = %err, "reconnect failed");
                    self.set_state(SessionState::Disconnected).await;
                }
            }
        }
    }

    /// Login (unless a key is cached), list, open, authorize, subscribe,
    /// then snapshot.
    async fn establish(&mut self) -> Result<Established<C::Connection>, CloudError> {
        let cached = self.token.clone().filter(|token| token.is_valid_at(now()));
        let (token, fresh) = match cached {
            Some(token) => (token, false),
            None => {
                let token = self.connector.login().await?;
                self.token = Some(token.clone());
                (token, true)
            }
        };
        let devices = self.connector.devices().await?;
        let mut connection = self.connector.open().await?;

        let auth_id = self.next_request_id();
        let authorized = tokio::time::timeout(
            self.config.auth_timeout(),
            authorize(&mut connection, auth_id, &self.config.email, &token),
        )
        .await
        .map_err(|_| CloudError::Timeout("socket authorization"))??;
        if !authorized {
            connection.close().await;
            self.token = None;
            if fresh {
                return Err(CloudError::Unauthorized(
                    "socket authorization refused".to_string(),
                ));
            }
            // a stale key: the next attempt logs in again
            return Err(CloudError::Protocol("cached API key refused".to_string()));
        }

        for device in &devices {
            let id = self.next_request_id();
            connection
                .send_text(codec::subscribe_request(id, device))
                .await?;
            tracing::debug!(device_id = %device, "subscribed to attribute updates");
        }

        let mut backlog = Vec::new();
        let fetched = fetch_snapshot(&self.connector, &devices, &mut connection, &mut backlog).await;
        match fetched {
            Ok(snapshot) => Ok(Established {
                connection,
                snapshot,
                backlog,
            }),
            Err(err) => {
                connection.close().await;
                Err(err)
            }
        }
    }

    async fn connected(&mut self, snapshot: Snapshot, backlog: Vec<String>) {
        tracing::info!(devices = snapshot.devices.len(), "cloud session connected");
        self.modules = snapshot.modules;
        self.set_state(SessionState::Connected).await;
        self.emit(SessionEvent::Frame(CloudFrame::Snapshot(snapshot.devices)))
            .await;
        if !backlog.is_empty() {
            tracing::debug!(frames = backlog.len(), "replaying frames received during resync");
        }
        for text in backlog {
            self.dispatch(&text).await;
        }
    }

    async fn transmit(
        &mut self,
        connection: &mut C::Connection,
        request: Request,
    ) -> Result<(), CloudError> {
        let Request { command, reply } = request;
        let id = self.next_request_id();
        let text = match codec::command_request(id, &command, &self.modules) {
            Ok(text) => text,
            Err(err) => {
                let _ = reply.send(Err(err.into_domain()));
                return Ok(());
            }
        };
        match connection.send_text(text).await {
            Ok(()) => {
                self.in_flight.insert(id, command.id);
                while self.in_flight.len() > MAX_IN_FLIGHT {
                    self.in_flight.pop_first();
                }
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Err(err) => {
                let _ = reply.send(Err(BridgeError::SessionClosed));
                Err(err)
            }
        }
    }

    async fn dispatch(&mut self, text: &str) {
        match codec::decode_inbound(text, now()) {
            Ok(Inbound::Notification(delta)) => {
                self.emit(SessionEvent::Frame(CloudFrame::Delta(delta))).await;
            }
            Ok(Inbound::Reply { id, outcome }) => {
                let Some(command_id) = self.in_flight.remove(&id) else {
                    tracing::trace!(request_id = id, "reply to a non-command request");
                    return;
                };
                if let Err(error) = &outcome {
                    tracing::warn!(command_id = %command_id, error = %error, "cloud rejected command");
                }
                let ack = CommandAck {
                    command_id,
                    accepted: outcome.is_ok(),
                };
                self.emit(SessionEvent::Frame(CloudFrame::Ack(ack))).await;
            }
            Ok(Inbound::Ignored) => {}
            Err(err) => tracing::warn!(error = %err, "dropping undecodable cloud frame"),
        }
    }

    async fn set_state(&mut self, next: SessionState) {
        let current = *self.state.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(from = %current, to = %next, "unexpected session transition");
        }
        self.state.send_replace(next);
        tracing::debug!(from = %current, to = %next, "cloud session state");
        self.emit(SessionEvent::StateChanged(next)).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("session events receiver dropped");
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Send `srvWebSocketAuth` and wait for its reply.
async fn authorize<N: Connection>(
    connection: &mut N,
    id: u64,
    email: &str,
    token: &AuthToken,
) -> Result<bool, CloudError> {
    connection
        .send_text(codec::auth_request(id, email, token.api_key()))
        .await?;
    loop {
        match connection.recv().await {
            None => return Err(CloudError::Closed),
            Some(Err(err)) => return Err(err),
            Some(Ok(Incoming::Pong)) => {}
            Some(Ok(Incoming::Text(text))) => match codec::decode_inbound(&text, now()) {
                Ok(Inbound::Reply { id: reply, outcome }) if reply == id => {
                    return Ok(outcome.as_ref().is_ok_and(codec::is_authorized));
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(error = %err, "ignoring frame before authorization"),
            },
        }
    }
}

/// Fetch the snapshot while holding back whatever the socket delivers.
async fn fetch_snapshot<C: Connector>(
    connector: &C,
    devices: &[DeviceId],
    connection: &mut C::Connection,
    backlog: &mut Vec<String>,
) -> Result<Snapshot, CloudError> {
    let fetch = connector.snapshot(devices);
    tokio::pin!(fetch);
    loop {
        tokio::select! {
            biased;
            snapshot = &mut fetch => return snapshot,
            incoming = connection.recv() => match incoming {
                None => return Err(CloudError::Closed),
                Some(Err(err)) => return Err(err),
                Some(Ok(Incoming::Pong)) => {}
                Some(Ok(Incoming::Text(text))) => backlog.push(text),
            },
        }
    }
}

/// Sleep for `delay`, answering every command with `SessionClosed`.
///
/// Returns `false` on shutdown.
async fn refuse_while_waiting(
    delay: std::time::Duration,
    commands: &mut mpsc::Receiver<Request>,
    stop: &CancellationToken,
) -> bool {
    let wake = tokio::time::sleep(delay);
    tokio::pin!(wake);
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return false,
            () = &mut wake => return true,
            request = commands.recv() => match request {
                Some(request) => {
                    let _ = request.reply.send(Err(BridgeError::SessionClosed));
                }
                None => return false,
            },
        }
    }
}
