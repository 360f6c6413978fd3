//! Cloud adapter error types.

use ryobi_gdo2mqtt_domain::error::{AuthError, BridgeError};
use tokio_tungstenite::tungstenite;

/// Errors specific to the cloud adapter.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The cloud refused the credentials or the API key.
    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    /// The HTTP client failed (connect, TLS, timeout, body).
    #[error("HTTP request failed")]
    Http(#[source] reqwest::Error),

    /// The REST API answered with an unexpected status.
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    /// The WebSocket transport failed.
    #[error("WebSocket error")]
    WebSocket(#[source] Box<tungstenite::Error>),

    /// The configured host does not form a valid URL.
    #[error("invalid URL")]
    InvalidUrl(#[source] url::ParseError),

    /// A cloud payload was not valid JSON or had the wrong shape.
    #[error("malformed cloud payload")]
    Decode(#[source] serde_json::Error),

    /// A cloud payload was valid JSON but not what the protocol expects.
    #[error("unexpected cloud payload: {0}")]
    Protocol(String),

    /// A reply did not arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The socket was closed by the peer.
    #[error("connection closed by the cloud")]
    Closed,
}

impl CloudError {
    /// Whether reconnecting cannot help.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Convert into a [`BridgeError`] for propagation across port
    /// boundaries.
    pub fn into_domain(self) -> BridgeError {
        match self {
            Self::Unauthorized(reason) => BridgeError::Auth(AuthError { reason }),
            Self::Closed => BridgeError::SessionClosed,
            other => BridgeError::network(other),
        }
    }
}

impl From<CloudError> for BridgeError {
    fn from(err: CloudError) -> Self {
        err.into_domain()
    }
}

impl From<tungstenite::Error> for CloudError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
