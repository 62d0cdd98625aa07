//! Port lifecycle and the framer read loop.
//!
//! `PortLink` owns the open/teardown cycle for one named port: opening
//! installs the writer half into the Transport and spawns a read loop that
//! feeds the frame parser one byte at a time and forwards complete packets
//! to the dispatcher queue. The reconnector calls `connect` again after a
//! fault; only the port and the read loop are rebuilt — the dispatcher and
//! every registered listener survive.

use std::sync::Arc;
use std::time::Duration;

use stim_protocol::{FrameParser, Packet};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::port::{PortOpener, PortReader};
use crate::transport::Transport;
use crate::util::join_bounded;

struct ReadLoopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct PortLink {
    opener: Arc<dyn PortOpener>,
    port_name: String,
    read_timeout: Duration,
    transport: Arc<Transport>,
    packet_tx: mpsc::Sender<Packet>,
    read_loop: Mutex<Option<ReadLoopHandle>>,
}

impl PortLink {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        port_name: &str,
        read_timeout: Duration,
        transport: Arc<Transport>,
        packet_tx: mpsc::Sender<Packet>,
    ) -> Self {
        PortLink {
            opener,
            port_name: port_name.to_owned(),
            read_timeout,
            transport,
            packet_tx,
            read_loop: Mutex::new(None),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open (or reopen) the port: tear down any previous link, install the
    /// writer, and start a fresh read loop with a fresh frame parser.
    pub async fn connect(&self) -> std::io::Result<()> {
        self.disconnect().await;
        let pair = self.opener.open(&self.port_name)?;
        self.transport.install_writer(pair.writer).await;
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(read_loop(
            pair.reader,
            self.packet_tx.clone(),
            self.read_timeout,
            stop_rx,
        ));
        *self.read_loop.lock().await = Some(ReadLoopHandle { stop, task });
        debug!(port = %self.port_name, "port link up");
        Ok(())
    }

    /// Stop the read loop and drop the writer. Safe to call when already
    /// disconnected.
    pub async fn disconnect(&self) {
        self.transport.clear_writer().await;
        if let Some(handle) = self.read_loop.lock().await.take() {
            let _ = handle.stop.send(true);
            join_bounded("port read loop", handle.task).await;
        }
    }
}

/// Byte pump: single-byte reads with a soft timeout, cancellation observed
/// between reads.
async fn read_loop(
    mut reader: PortReader,
    packet_tx: mpsc::Sender<Packet>,
    read_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut parser = FrameParser::new();
    let mut byte = [0u8; 1];
    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            read = tokio::time::timeout(read_timeout, reader.read(&mut byte)) => match read {
                // Soft timeout: only noteworthy when it interrupts a frame.
                Err(_elapsed) => {
                    if parser.in_frame() {
                        warn!("incomplete packet");
                    }
                }
                Ok(Ok(0)) => {
                    warn!("port closed");
                    break;
                }
                Ok(Ok(_)) => match parser.push(byte[0]) {
                    Ok(Some(packet)) => {
                        if packet_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "dropping bad frame"),
                },
                Ok(Err(e)) => {
                    warn!(error = %e, "port read failed");
                    break;
                }
            }
        }
    }
    debug!("read loop stopped");
}
