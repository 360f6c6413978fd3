//! Network seam of the session manager.
//!
//! [`Connector`] performs the REST calls and opens sockets; [`Connection`]
//! is one open socket carrying text frames. The session manager only talks
//! to these traits, so its reconnect and heartbeat logic runs unchanged
//! against in-memory fakes.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use ryobi_gdo2mqtt_domain::device::Device;
use ryobi_gdo2mqtt_domain::id::DeviceId;
use ryobi_gdo2mqtt_domain::session::AuthToken;

use crate::codec::{DecodedDevice, ModuleIndex};
use crate::config::CloudConfig;
use crate::error::CloudError;
use crate::rest::RestClient;

/// What arrived on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    /// Answer to a heartbeat ping.
    Pong,
}

/// Every bridged device plus where its modules live.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub devices: Vec<Device>,
    pub modules: ModuleIndex,
}

impl From<Vec<DecodedDevice>> for Snapshot {
    fn from(decoded: Vec<DecodedDevice>) -> Self {
        let mut snapshot = Self::default();
        for DecodedDevice { device, modules } in decoded {
            snapshot.modules.insert(device.id.clone(), modules);
            snapshot.devices.push(device);
        }
        snapshot
    }
}

/// One open socket.
pub trait Connection: Send + 'static {
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Send a heartbeat ping. The answer arrives as [`Incoming::Pong`].
    fn ping(&mut self) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Next frame. `None` once the peer closed the socket.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Incoming, CloudError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Everything the session needs from the network.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Exchange credentials for an API key.
    fn login(&self) -> impl Future<Output = Result<AuthToken, CloudError>> + Send;

    /// Ids of every bridged device.
    fn devices(&self) -> impl Future<Output = Result<Vec<DeviceId>, CloudError>> + Send;

    /// Full state of the given devices.
    fn snapshot(
        &self,
        devices: &[DeviceId],
    ) -> impl Future<Output = Result<Snapshot, CloudError>> + Send;

    /// Open the JSON-RPC socket. Authorization is up to the caller.
    fn open(&self) -> impl Future<Output = Result<Self::Connection, CloudError>> + Send;
}

/// Production connector: reqwest for REST, tokio-tungstenite for the socket.
#[derive(Debug, Clone)]
pub struct RyobiConnector {
    config: CloudConfig,
    rest: RestClient,
    websocket_url: Url,
}

impl RyobiConnector {
    /// # Errors
    ///
    /// Returns [`CloudError::InvalidUrl`] for a bad host.
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        Ok(Self {
            rest: RestClient::new(&config)?,
            websocket_url: config.websocket_url()?,
            config,
        })
    }
}

impl Connector for RyobiConnector {
    type Connection = WsConnection;

    fn login(&self) -> impl Future<Output = Result<AuthToken, CloudError>> + Send {
        self.rest.login()
    }

    fn devices(&self) -> impl Future<Output = Result<Vec<DeviceId>, CloudError>> + Send {
        self.rest.bridged_devices(&self.config)
    }

    fn snapshot(
        &self,
        devices: &[DeviceId],
    ) -> impl Future<Output = Result<Snapshot, CloudError>> + Send {
        async move { self.rest.snapshot(devices).await.map(Snapshot::from) }
    }

    fn open(&self) -> impl Future<Output = Result<WsConnection, CloudError>> + Send {
        async move {
            tracing::debug!(url = %self.websocket_url, "opening cloud socket");
            let (stream, _response) =
                tokio_tungstenite::connect_async(self.websocket_url.as_str()).await?;
            Ok(WsConnection { stream })
        }
    }
}

/// A tokio-tungstenite socket.
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), CloudError>> + Send {
        async move {
            self.stream.send(Message::text(text)).await?;
            Ok(())
        }
    }

    fn ping(&mut self) -> impl Future<Output = Result<(), CloudError>> + Send {
        async move {
            self.stream.send(Message::Ping(Default::default())).await?;
            Ok(())
        }
    }

    fn recv(&mut self) -> impl Future<Output = Option<Result<Incoming, CloudError>>> + Send {
        async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(Incoming::Text(text.as_str().to_owned()))),
                    Ok(Message::Pong(_)) => return Some(Ok(Incoming::Pong)),
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            tracing::info!(code = %frame.code, reason = %frame.reason, "cloud closed the socket");
                        }
                        return None;
                    }
                    // tungstenite answers pings on its own
                    Ok(Message::Ping(_) | Message::Binary(_) | Message::Frame(_)) => {}
                    Err(err) => return Some(Err(err.into())),
                }
            }
        }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(err) = self.stream.close(None).await {
                tracing::debug!(error = %err, "cloud socket did not close cleanly");
            }
        }
    }
}
