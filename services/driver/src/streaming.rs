//! Streaming session controller.
//!
//! Lives from `start_streaming` to `stop_streaming`, across any number of
//! reconnects. On construction it registers the StreamData listener,
//! activates streaming at the device, and starts the therapy monitor and
//! the CSV log; on every later `Connected` event it re-activates streaming
//! (one activation in flight at a time).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stim_protocol::{DeviceErrorCode, OpCode, PacketType, StreamingSample};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StreamLogConfig;
use crate::dispatcher::{Dispatcher, ListenerId};
use crate::events::{ConnectionStatus, EventBus};
use crate::stream_log::{LogRow, StreamLog};
use crate::therapy::TherapyMonitor;
use crate::transport::Transport;
use crate::util::{join_bounded, sleep_cancellable};

/// Delay between StartStreaming retries.
const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// StopStreaming attempts during teardown.
const CANCEL_RETRY_LIMIT: u32 = 3;

pub struct StreamingController {
    dispatcher: Dispatcher,
    transport: Arc<Transport>,
    listener: ListenerId,
    therapy: TherapyMonitor,
    log: StreamLog,
    shutdown: watch::Sender<bool>,
    status_task: JoinHandle<()>,
}

impl StreamingController {
    pub(crate) async fn start(
        dispatcher: Dispatcher,
        transport: Arc<Transport>,
        events: Arc<EventBus>,
        log_cfg: &StreamLogConfig,
        therapy_enabled: bool,
    ) -> std::io::Result<Self> {
        let log = StreamLog::create(log_cfg).await?;
        let therapy =
            TherapyMonitor::start(Arc::clone(&transport), Arc::clone(&events), therapy_enabled);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inflight = Arc::new(AtomicBool::new(false));

        // StreamData listener: decode and fan out to the event bus, the
        // therapy monitor, and the log queue. Always claims.
        let listener = {
            let events = Arc::clone(&events);
            let sample_tx = therapy.sample_sender();
            let shared = therapy.shared();
            let log_tx = log.sender();
            dispatcher.register(
                PacketType::StreamData,
                false,
                Box::new(move |packet| {
                    let Some(sample) = StreamingSample::from_stream_payload(packet.payload())
                    else {
                        warn!(len = packet.payload().len(), "undersized stream payload");
                        return true;
                    };
                    events.emit_sample(sample);
                    if sample_tx.try_send(sample).is_err() {
                        debug!("therapy sample queue full; dropping sample");
                    }
                    let _ = log_tx.send(LogRow {
                        timestamp_ms: sample.timestamp_ms,
                        voltage_mv: sample.voltage_mv,
                        in_seizure: shared.in_seizure(),
                        therapy_needed: shared.therapy_needed(),
                    });
                    true
                }),
            )
        };

        // Watch connection status; a reconnect re-activates streaming.
        let status_task = {
            let transport = Arc::clone(&transport);
            let inflight = Arc::clone(&inflight);
            let mut connection_rx = events.subscribe_connection();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        event = connection_rx.recv() => match event {
                            Ok(ConnectionStatus::Connected) => {
                                debug!("connected; re-activating streaming");
                                tokio::spawn(init_stream(
                                    Arc::clone(&transport),
                                    Arc::clone(&inflight),
                                    shutdown_rx.clone(),
                                ));
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(skipped, "status subscriber lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            })
        };

        // The first activation completes before streaming is reported up.
        init_stream(Arc::clone(&transport), inflight, shutdown_rx).await;

        Ok(StreamingController {
            dispatcher,
            transport,
            listener,
            therapy,
            log,
            shutdown,
            status_task,
        })
    }

    pub(crate) fn set_therapy_enabled(&self, enabled: bool) {
        self.therapy.set_enabled(enabled);
    }

    pub fn log_path(&self) -> &std::path::Path {
        self.log.path()
    }

    /// Tear down: therapy monitor first, then streaming deactivation, then
    /// the listener and the log writer.
    pub(crate) async fn stop(self) {
        self.therapy.stop().await;
        let _ = self.shutdown.send(true);
        join_bounded("streaming status watcher", self.status_task).await;

        for attempt in 1..=CANCEL_RETRY_LIMIT {
            match self.transport.send_command(OpCode::StopStreaming, &[]).await {
                Ok(()) | Err(DeviceErrorCode::AlreadyStopStreaming) => {
                    info!("streaming deactivated");
                    break;
                }
                Err(e @ (DeviceErrorCode::BadChecksum | DeviceErrorCode::TimeoutExpired))
                    if attempt < CANCEL_RETRY_LIMIT =>
                {
                    debug!(attempt, error = %e, "stop streaming retry");
                }
                Err(e) => {
                    warn!(error = %e, "stop streaming not acknowledged");
                    break;
                }
            }
        }

        if self
            .dispatcher
            .unregister(PacketType::StreamData, self.listener)
            .is_err()
        {
            debug!("stream listener already removed");
        }
        self.log.shutdown().await;
    }
}

/// Activate streaming at the device, retrying until it sticks or the
/// controller shuts down. `AlreadyStreaming` counts as success. The
/// `inflight` guard keeps reconnect-triggered activations from stacking.
async fn init_stream(
    transport: Arc<Transport>,
    inflight: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    if inflight.swap(true, Ordering::SeqCst) {
        return;
    }
    loop {
        if *shutdown.borrow() {
            break;
        }
        match transport.send_command(OpCode::StartStreaming, &[]).await {
            Ok(()) | Err(DeviceErrorCode::AlreadyStreaming) => {
                info!("streaming activated");
                break;
            }
            Err(e) => {
                debug!(error = %e, "start streaming failed; retrying");
                if sleep_cancellable(INIT_RETRY_DELAY, &mut shutdown).await {
                    break;
                }
            }
        }
    }
    inflight.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use stim_protocol::Packet;
    use tokio::time::{sleep, timeout};

    struct Fixture {
        transport: Arc<Transport>,
        dispatcher: Dispatcher,
        _stop: watch::Sender<bool>,
        _peer: tokio::io::DuplexStream,
    }

    async fn fixture() -> Fixture {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (dispatcher, _task) = Dispatcher::start(8, stop_rx);
        let transport = Arc::new(Transport::new(dispatcher.clone(), Duration::from_millis(100)));
        let (port, peer) = tokio::io::duplex(1024);
        let (_port_read, port_write) = tokio::io::split(port);
        transport.install_writer(Box::new(port_write)).await;
        Fixture {
            transport,
            dispatcher,
            _stop: stop_tx,
            _peer: peer,
        }
    }

    #[tokio::test]
    async fn init_stream_treats_already_streaming_as_success() {
        let f = fixture().await;
        let inflight = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(init_stream(
            Arc::clone(&f.transport),
            Arc::clone(&inflight),
            rx,
        ));
        sleep(Duration::from_millis(30)).await;
        let reply = Packet::new(
            PacketType::Error,
            0,
            vec![DeviceErrorCode::AlreadyStreaming.as_byte()],
        )
        .unwrap();
        f.dispatcher.sender().send(reply).await.unwrap();

        timeout(Duration::from_secs(1), task)
            .await
            .expect("init_stream should finish")
            .unwrap();
        assert!(!inflight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn duplicate_activation_is_suppressed_by_the_inflight_guard() {
        let f = fixture().await;
        let inflight = Arc::new(AtomicBool::new(true));
        let (_tx, rx) = watch::channel(false);

        // With the guard held, the call returns immediately without
        // clearing someone else's flag.
        init_stream(Arc::clone(&f.transport), Arc::clone(&inflight), rx).await;
        assert!(inflight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn init_stream_retries_on_timeout_until_acked() {
        let f = fixture().await;
        let inflight = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(init_stream(
            Arc::clone(&f.transport),
            Arc::clone(&inflight),
            rx,
        ));
        // The first attempt (id 0) never gets a reply; keep acks flowing for
        // every retry id so whichever retry lands first succeeds.
        let acker = tokio::spawn({
            let sender = f.dispatcher.sender();
            async move {
                loop {
                    for id in 1u8..=5 {
                        let ack = Packet::new(PacketType::Command, id, vec![0x00]).unwrap();
                        if sender.send(ack).await.is_err() {
                            return;
                        }
                    }
                    sleep(Duration::from_millis(50)).await;
                }
            }
        });

        timeout(Duration::from_secs(3), task)
            .await
            .expect("init_stream should finish after the retry")
            .unwrap();
        acker.abort();
    }
}
