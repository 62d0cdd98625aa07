//! Outbound command transport.
//!
//! `send_command` is the synchronous request/response primitive: it encodes
//! a Command frame with a fresh sequence id, registers a one-shot reply
//! listener keyed on that id *before* writing (so a reply racing the write
//! cannot be lost), writes under the exclusive write lock, and waits for
//! the reply or the timeout.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use stim_protocol::packet::encode_command;
use stim_protocol::{DeviceErrorCode, OpCode, PacketType};
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::port::PortWriter;

pub struct Transport {
    dispatcher: Dispatcher,
    /// Write lock and the writer itself. `None` between close/reconnects.
    writer: Mutex<Option<PortWriter>>,
    sequence: AtomicU32,
    command_timeout: Duration,
}

impl Transport {
    pub fn new(dispatcher: Dispatcher, command_timeout: Duration) -> Self {
        Transport {
            dispatcher,
            writer: Mutex::new(None),
            sequence: AtomicU32::new(0),
            command_timeout,
        }
    }

    /// Install the writer half of a freshly opened port.
    pub async fn install_writer(&self, writer: PortWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Drop the writer; subsequent sends return `NotOpen` without I/O.
    pub async fn clear_writer(&self) {
        *self.writer.lock().await = None;
    }

    /// Next sequence id, wrapping modulo 256.
    fn next_id(&self) -> u8 {
        (self.sequence.fetch_add(1, Ordering::Relaxed) % 256) as u8
    }

    /// Send one command and wait for its reply.
    ///
    /// Returns `Ok(())` on a non-error reply with a matching id, the device
    /// error code from an Error reply, `TimeoutExpired` when no reply
    /// arrives in time, `ComFailed` on a write failure, and `NotOpen` when
    /// no port is installed.
    pub async fn send_command(&self, op: OpCode, data: &[u8]) -> Result<(), DeviceErrorCode> {
        let id = self.next_id();
        let frame = match encode_command(id, op, data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(?op, error = %e, "refusing to encode oversized command");
                return Err(DeviceErrorCode::PayloadLengthExceedsMax);
            }
        };

        // Register the reply listener before the frame hits the wire.
        let (done_tx, done_rx) = oneshot::channel::<Result<(), DeviceErrorCode>>();
        let mut done_tx = Some(done_tx);
        let listener = self.dispatcher.register(
            PacketType::Command,
            true,
            Box::new(move |packet| {
                if packet.id() != id {
                    return false;
                }
                let outcome = match packet.packet_type() {
                    PacketType::Error => {
                        let code = packet.payload().first().copied().unwrap_or(0xFF);
                        Err(DeviceErrorCode::from(code))
                    }
                    _ => Ok(()),
                };
                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(outcome);
                }
                true
            }),
        );

        {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                let _ = self.dispatcher.unregister(PacketType::Command, listener);
                return Err(DeviceErrorCode::NotOpen);
            };
            let write = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            };
            if let Err(e) = write.await {
                warn!(?op, id, error = %e, "command write failed");
                let _ = self.dispatcher.unregister(PacketType::Command, listener);
                return Err(DeviceErrorCode::ComFailed);
            }
        }

        match tokio::time::timeout(self.command_timeout, done_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => {
                // Dispatcher went away mid-flight (session closing).
                let _ = self.dispatcher.unregister(PacketType::Command, listener);
                Err(DeviceErrorCode::ComFailed)
            }
            Err(_elapsed) => {
                debug!(?op, id, "no reply within command timeout");
                let _ = self.dispatcher.unregister(PacketType::Command, listener);
                Err(DeviceErrorCode::TimeoutExpired)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stim_protocol::Packet;
    use tokio::sync::watch;
    use tokio::time::Duration;

    fn transport() -> (Transport, Dispatcher, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (dispatcher, _task) = Dispatcher::start(8, stop_rx);
        let t = Transport::new(dispatcher.clone(), Duration::from_millis(100));
        (t, dispatcher, stop_tx)
    }

    #[tokio::test]
    async fn send_without_port_returns_not_open() {
        let (t, _d, _stop) = transport();
        assert_eq!(
            t.send_command(OpCode::WatchdogReset, &[]).await,
            Err(DeviceErrorCode::NotOpen)
        );
    }

    #[tokio::test]
    async fn matching_ack_resolves_ok() {
        let (t, d, _stop) = transport();
        let (port, _peer) = tokio::io::duplex(256);
        let (_port_read, port_write) = tokio::io::split(port);
        t.install_writer(Box::new(port_write)).await;

        // First send uses id 0; inject the matching ack while it waits.
        let queue = d.sender();
        let send = t.send_command(OpCode::WatchdogReset, &[]);
        let inject = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let ack = Packet::new(PacketType::Command, 0, vec![0x00]).unwrap();
            queue.send(ack).await.unwrap();
        };
        let (outcome, ()) = tokio::join!(send, inject);
        assert_eq!(outcome, Ok(()));
    }

    #[tokio::test]
    async fn error_reply_surfaces_device_code() {
        let (t, d, _stop) = transport();
        let (port, _peer) = tokio::io::duplex(256);
        let (_port_read, port_write) = tokio::io::split(port);
        t.install_writer(Box::new(port_write)).await;

        let queue = d.sender();
        let send = t.send_command(OpCode::StartStreaming, &[]);
        let inject = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let err = Packet::new(
                PacketType::Error,
                0,
                vec![DeviceErrorCode::AlreadyStreaming.as_byte()],
            )
            .unwrap();
            queue.send(err).await.unwrap();
        };
        let (outcome, ()) = tokio::join!(send, inject);
        assert_eq!(outcome, Err(DeviceErrorCode::AlreadyStreaming));
    }

    #[tokio::test]
    async fn reply_with_wrong_id_is_ignored_until_timeout() {
        let (t, d, _stop) = transport();
        let (port, _peer) = tokio::io::duplex(256);
        let (_port_read, port_write) = tokio::io::split(port);
        t.install_writer(Box::new(port_write)).await;

        let queue = d.sender();
        let send = t.send_command(OpCode::WatchdogReset, &[]);
        let inject = async move {
            let ack = Packet::new(PacketType::Command, 77, vec![0x00]).unwrap();
            queue.send(ack).await.unwrap();
        };
        let (outcome, ()) = tokio::join!(send, inject);
        assert_eq!(outcome, Err(DeviceErrorCode::TimeoutExpired));
    }

    #[tokio::test]
    async fn timeout_unregisters_the_reply_listener() {
        let (t, d, _stop) = transport();
        let (port, _peer) = tokio::io::duplex(256);
        let (_port_read, port_write) = tokio::io::split(port);
        t.install_writer(Box::new(port_write)).await;

        assert_eq!(
            t.send_command(OpCode::WatchdogReset, &[]).await,
            Err(DeviceErrorCode::TimeoutExpired)
        );

        // A late ack for id 0 must find no listener left behind.
        let late = Packet::new(PacketType::Command, 0, vec![0x00]).unwrap();
        d.sender().send(late).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Nothing to assert directly; the dispatcher logs the orphan. The
        // real check: the next command (id 1) still works normally.
        let queue = d.sender();
        let send = t.send_command(OpCode::WatchdogReset, &[]);
        let inject = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let ack = Packet::new(PacketType::Command, 1, vec![0x00]).unwrap();
            queue.send(ack).await.unwrap();
        };
        let (outcome, ()) = tokio::join!(send, inject);
        assert_eq!(outcome, Ok(()));
    }

    #[tokio::test]
    async fn sequence_ids_wrap_modulo_256() {
        let (t, _d, _stop) = transport();
        for _ in 0..255 {
            let _ = t.next_id();
        }
        assert_eq!(t.next_id(), 255);
        assert_eq!(t.next_id(), 0);
    }
}
