//! # ryobi_gdo_2_mqtt: Ryobi garage door to MQTT bridge
//!
//! Composition root that wires the cloud session and the MQTT client into
//! the bridge.
//!
//! ## Responsibilities
//! - Load configuration (config file, env vars)
//! - Initialize logging
//! - Establish the first cloud session, retrying transient failures
//! - Connect to the MQTT broker
//! - Run the bridge until SIGTERM/SIGINT, then shut down gracefully
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer: no domain logic belongs here.

mod config;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ryobi_gdo2mqtt_adapter_cloud::{
    Backoff, CloudConfig, CloudError, RyobiConnector, SessionEvents, SessionHandle, SessionManager,
};
use ryobi_gdo2mqtt_app::bridge::Bridge;

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config.log_filter());
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting ryobi_gdo_2_mqtt");

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let Some((session, frames)) = connect_cloud(&config.cloud, &shutdown).await? else {
        tracing::info!("shutdown requested before the cloud session came up");
        return Ok(());
    };

    let mapper = config.mqtt.topic_mapper();
    let (publisher, mqtt) = ryobi_gdo2mqtt_adapter_mqtt::connect(&config.mqtt);
    let bridge = Bridge::new(
        session,
        frames,
        publisher,
        mqtt,
        mapper,
        config.bridge.bridge_config(),
    );

    if let Err(err) = bridge.run(shutdown).await {
        tracing::error!(error = %err, "bridge stopped");
        return Err(err.into());
    }
    tracing::info!("bridge stopped");
    Ok(())
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Establish the first cloud session.
///
/// Transient failures are retried with backoff until `shutdown` fires, in
/// which case `None` is returned. Refused credentials end the process.
async fn connect_cloud(
    config: &CloudConfig,
    shutdown: &CancellationToken,
) -> Result<Option<(SessionHandle, SessionEvents)>, CloudError> {
    let connector = RyobiConnector::new(config.clone())?;
    let mut backoff = Backoff::new(config.reconnect_initial(), config.reconnect_max());
    loop {
        let manager = SessionManager::new(connector.clone(), config.clone());
        let attempt = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(None),
            attempt = manager.connect() => attempt,
        };
        match attempt {
            Ok(session) => return Ok(Some(session)),
            Err(err) if err.is_fatal() => {
                tracing::error!(error = %err, "cloud refused the credentials");
                return Err(err);
            }
            Err(err) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    attempt = backoff.attempt(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "cloud session unavailable, retrying"
                );
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(None),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for SIGTERM");
            return ctrl_c().await;
        }
    };
    tokio::select! {
        () = ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
