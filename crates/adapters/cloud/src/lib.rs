//! # ryobi-gdo2mqtt-adapter-cloud
//!
//! Cloud adapter: talks to the Ryobi GDO cloud on behalf of the bridge.
//!
//! ## How it works
//!
//! 1. `POST /api/login` exchanges the account credentials for an API key
//! 2. `GET /api/devices` plus one `GET /api/devices/<id>` per opener build
//!    the initial snapshot
//! 3. the JSON-RPC socket at `/api/wsrpc` is authorized with
//!    `srvWebSocketAuth` and subscribed to `<id>.wskAttributeUpdateNtfy`
//! 4. attribute notifications become deltas, command replies become
//!    acknowledgments
//!
//! The socket is pinged on a fixed interval. A missed pong or a dropped
//! socket triggers reconnection with exponential backoff, and every
//! reconnect re-reads the snapshot.
//!
//! ## Dependency rule
//!
//! Same as other adapters: depends on `ryobi-gdo2mqtt-app` and
//! `ryobi-gdo2mqtt-domain`.

pub mod backoff;
pub mod codec;
mod config;
mod error;
pub mod rest;
mod session;
pub mod transport;

pub use backoff::Backoff;
pub use config::CloudConfig;
pub use error::CloudError;
pub use session::{SessionEvents, SessionHandle, SessionManager};
pub use transport::{Connection, Connector, RyobiConnector};
