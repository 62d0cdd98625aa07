//! Handshake and reconnection.
//!
//! The handshake sends `InitialConnection` with bounded retries; a device
//! reply of `AlreadyConnected` counts as success (the device kept session
//! state across a host restart or a dropped link).
//!
//! The reconnect loop never gives up on its own: it alternates handshake
//! attempts with full port rebuilds until it succeeds or is cancelled. The
//! dispatcher, every registered listener, and the streaming controller all
//! survive — only the port and its read loop are replaced.

use std::sync::Arc;
use std::time::Duration;

use stim_protocol::{DeviceErrorCode, OpCode};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{ConnectionStatus, EventBus};
use crate::link::PortLink;
use crate::transport::Transport;
use crate::util::sleep_cancellable;

/// The reconnect loop was cancelled before it could re-establish the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cancelled;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReconnectConfig {
    pub connection_attempts: u32,
    /// Delay between handshake retries; mirrors the command timeout.
    pub retry_delay: Duration,
    /// Delay before re-probing a port that failed to open.
    pub bad_port_retry_delay: Duration,
}

/// Send `InitialConnection` until the device acknowledges.
///
/// `TimeoutExpired` and `ComFailed` are retried (after `retry_delay`) up to
/// `connection_attempts` times; any other device error gives up at once.
pub(crate) async fn handshake(
    transport: &Transport,
    cfg: &ReconnectConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), DeviceErrorCode> {
    let mut last_error = DeviceErrorCode::TimeoutExpired;
    for attempt in 1..=cfg.connection_attempts {
        if *shutdown.borrow() {
            return Err(DeviceErrorCode::Cancelled);
        }
        match transport.send_command(OpCode::InitialConnection, &[]).await {
            Ok(()) | Err(DeviceErrorCode::AlreadyConnected) => {
                debug!(attempt, "handshake acknowledged");
                return Ok(());
            }
            Err(e @ (DeviceErrorCode::TimeoutExpired | DeviceErrorCode::ComFailed)) => {
                debug!(attempt, error = %e, "handshake attempt failed");
                last_error = e;
                if sleep_cancellable(cfg.retry_delay, shutdown).await {
                    return Err(DeviceErrorCode::Cancelled);
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "handshake rejected");
                return Err(e);
            }
        }
    }
    Err(last_error)
}

/// Run until reconnected or cancelled.
pub(crate) async fn run(
    transport: &Arc<Transport>,
    link: &Arc<PortLink>,
    events: &Arc<EventBus>,
    cfg: &ReconnectConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), Cancelled> {
    loop {
        events.emit_connection(ConnectionStatus::Disconnected);
        if *shutdown.borrow() {
            return Err(Cancelled);
        }

        match handshake(transport, cfg, shutdown).await {
            Ok(()) => {
                info!(port = link.port_name(), "reconnected");
                events.emit_connection(ConnectionStatus::Connected);
                return Ok(());
            }
            Err(DeviceErrorCode::Cancelled) => return Err(Cancelled),
            Err(e) => {
                debug!(error = %e, "handshake failed; rebuilding port");
            }
        }

        link.disconnect().await;
        match link.connect().await {
            Ok(()) => {
                // Fresh port and read loop; take the handshake from the top.
            }
            Err(e) => {
                warn!(port = link.port_name(), error = %e, "port reopen failed");
                events.emit_connection(ConnectionStatus::NoDevice);
                if sleep_cancellable(cfg.bad_port_retry_delay, shutdown).await {
                    return Err(Cancelled);
                }
            }
        }
    }
}
