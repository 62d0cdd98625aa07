//! Session watchdog.
//!
//! One task, one tick at a time: each tick feeds the device watchdog with
//! bounded retries, and a tick that exhausts its budget runs the reconnect
//! loop inline before the timer resumes. Running recovery inside the tick
//! handler is what makes the watchdog single-flight.

use std::sync::Arc;
use std::time::Duration;

use stim_protocol::{DeviceErrorCode, OpCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::EventBus;
use crate::link::PortLink;
use crate::reconnect::{self, ReconnectConfig};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy)]
pub(crate) struct WatchdogSettings {
    pub feed_interval: Duration,
    pub attempts: u32,
    pub reconnect: ReconnectConfig,
}

pub(crate) fn spawn(
    transport: Arc<Transport>,
    link: Arc<PortLink>,
    events: Arc<EventBus>,
    settings: WatchdogSettings,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run(transport, link, events, settings, shutdown))
}

async fn run(
    transport: Arc<Transport>,
    link: Arc<PortLink>,
    events: Arc<EventBus>,
    settings: WatchdogSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(settings.feed_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick is pointless right after the handshake.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if feed(&transport, settings.attempts).await {
                    continue;
                }
                warn!("watchdog lost the device; starting recovery");
                match reconnect::run(&transport, &link, &events, &settings.reconnect, &mut shutdown).await {
                    Ok(()) => ticker.reset(),
                    Err(_cancelled) => break,
                }
            }
        }
    }
    debug!("watchdog stopped");
}

/// One tick: up to `attempts` feeds. `NotConnected`/`NotOpen` are fatal for
/// the tick — the session is gone, so retrying the feed is pointless.
async fn feed(transport: &Transport, attempts: u32) -> bool {
    for attempt in 1..=attempts {
        match transport.send_command(OpCode::WatchdogReset, &[]).await {
            Ok(()) => return true,
            Err(e @ (DeviceErrorCode::NotConnected | DeviceErrorCode::NotOpen)) => {
                warn!(error = %e, "watchdog feed rejected");
                return false;
            }
            Err(e) => {
                debug!(attempt, error = %e, "watchdog feed failed");
            }
        }
    }
    false
}
