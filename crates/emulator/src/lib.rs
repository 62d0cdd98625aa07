//! In-process stimulation-device emulator.
//!
//! Speaks the exact wire protocol over any `AsyncRead`/`AsyncWrite` pair, so
//! test suites can stand in for the implant with `tokio::io::duplex` and the
//! driver cannot tell the difference. The emulator enforces the same command
//! preconditions as the firmware (connect before anything else, no double
//! start/stop) and streams deterministic synthetic samples while streaming
//! is active.
//!
//! # Fault injection
//! A [`FaultPlan`] can drop replies for selected opcodes, corrupt the
//! checksum of the first N replies, or blackout the watchdog after a number
//! of feeds — enough to drive every recovery path in the driver.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stim_protocol::sample::{encode_reading, stream_payload};
use stim_protocol::{DeviceErrorCode, FrameParser, OpCode, Packet, PacketType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Fault plan for one emulator instance.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Commands that never receive a reply.
    pub drop_replies: Vec<OpCode>,
    /// Corrupt the checksum of this many replies before behaving normally.
    pub corrupt_reply_checksums: u32,
    /// Stop acknowledging `WatchdogReset` after this many successful feeds.
    pub watchdog_blackout_after: Option<u32>,
    /// Go completely silent (no replies, no samples) after this many
    /// commands. Models a crashed or power-cycled device.
    pub dead_after_commands: Option<u32>,
}

/// Emulator configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Wall-clock period between StreamData frames while streaming.
    pub stream_period: Duration,
    /// Device-timestamp increment per sample, in milliseconds.
    pub timestamp_step_ms: u32,
    pub faults: FaultPlan,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            stream_period: Duration::from_millis(2),
            timestamp_step_ms: 2,
            faults: FaultPlan::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Observable device state
// ---------------------------------------------------------------------------

/// Device-side state, exposed so tests can assert on what the driver did.
#[derive(Debug, Default)]
pub struct SimState {
    pub connected: AtomicBool,
    pub streaming: AtomicBool,
    pub therapy: AtomicBool,
    pub watchdog_feeds: AtomicU32,
    pub commands_seen: AtomicU32,
}

impl SimState {
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn is_therapy_on(&self) -> bool {
        self.therapy.load(Ordering::SeqCst)
    }

    pub fn feeds(&self) -> u32 {
        self.watchdog_feeds.load(Ordering::SeqCst)
    }
}

/// Handle to a running emulator task.
pub struct SimHandle {
    state: Arc<SimState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SimHandle {
    pub fn state(&self) -> Arc<SimState> {
        Arc::clone(&self.state)
    }

    /// Stop the emulator and wait for its task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// DeviceSim
// ---------------------------------------------------------------------------

pub struct DeviceSim;

impl DeviceSim {
    /// Spawn an emulator driving the given link halves until the link closes
    /// or the handle is stopped.
    pub fn spawn<R, W>(reader: R, writer: W, config: SimConfig) -> SimHandle
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let state = Arc::new(SimState::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            reader,
            writer,
            config,
            Arc::clone(&state),
            shutdown_rx,
        ));
        SimHandle {
            state,
            shutdown,
            task,
        }
    }
}

async fn run<R, W>(
    mut reader: R,
    mut writer: W,
    config: SimConfig,
    state: Arc<SimState>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut parser = FrameParser::new();
    let mut byte = [0u8; 1];
    let mut ticker = tokio::time::interval(config.stream_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut corrupt_budget = config.faults.corrupt_reply_checksums;
    let mut device_seq: u8 = 0;
    let mut device_ts: u32 = 0;
    let mut sample_idx: u64 = 0;
    let mut dead = false;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick(), if state.streaming.load(Ordering::SeqCst) && !dead => {
                let frame = next_sample_frame(&mut device_seq, &mut device_ts, &mut sample_idx, config.timestamp_step_ms);
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            read = reader.read(&mut byte) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => match parser.push(byte[0]) {
                    Ok(Some(packet)) => {
                        if packet.packet_type() == PacketType::Command {
                            let seen = state.commands_seen.fetch_add(1, Ordering::SeqCst) + 1;
                            if let Some(limit) = config.faults.dead_after_commands {
                                if seen > limit && !dead {
                                    debug!(seen, "device going dead");
                                    dead = true;
                                }
                            }
                        }
                        if dead {
                            continue;
                        }
                        if let Some(mut reply) = handle_packet(&packet, &config.faults, &state) {
                            if corrupt_budget > 0 {
                                corrupt_budget -= 1;
                                let last = reply.len() - 1;
                                reply[last] = reply[last].wrapping_add(1);
                                debug!(id = packet.id(), "corrupting reply checksum");
                            }
                            if writer.write_all(&reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "emulator dropped malformed frame"),
                },
            }
        }
    }
}

/// Process one inbound packet and build the reply frame, if any.
fn handle_packet(packet: &Packet, faults: &FaultPlan, state: &SimState) -> Option<Vec<u8>> {
    if packet.packet_type() != PacketType::Command {
        warn!(?packet, "emulator ignoring non-command packet");
        return None;
    }

    let Some(op) = OpCode::from_byte(packet.payload()[0]) else {
        return Some(error_frame(packet.id(), DeviceErrorCode::BadOpCode));
    };

    if faults.drop_replies.contains(&op) {
        debug!(?op, "emulator dropping reply");
        return None;
    }

    let connected = state.connected.load(Ordering::SeqCst);
    let outcome = match op {
        OpCode::InitialConnection => {
            if connected {
                Err(DeviceErrorCode::AlreadyConnected)
            } else {
                state.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
        OpCode::WatchdogReset => {
            if !connected {
                Err(DeviceErrorCode::NotConnected)
            } else {
                let feeds = state.watchdog_feeds.load(Ordering::SeqCst);
                if let Some(limit) = faults.watchdog_blackout_after {
                    if feeds >= limit {
                        debug!(feeds, "watchdog blackout active");
                        return None;
                    }
                }
                state.watchdog_feeds.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        OpCode::StartStreaming => {
            if !connected {
                Err(DeviceErrorCode::NotConnected)
            } else if state.streaming.swap(true, Ordering::SeqCst) {
                Err(DeviceErrorCode::AlreadyStreaming)
            } else {
                Ok(())
            }
        }
        OpCode::StopStreaming => {
            if !state.streaming.swap(false, Ordering::SeqCst) {
                Err(DeviceErrorCode::AlreadyStopStreaming)
            } else {
                Ok(())
            }
        }
        OpCode::StartTherapy => {
            if !connected {
                Err(DeviceErrorCode::NotConnected)
            } else if state.therapy.swap(true, Ordering::SeqCst) {
                Err(DeviceErrorCode::AlreadyDoingTherapy)
            } else {
                Ok(())
            }
        }
        OpCode::StopTherapy => {
            if !state.therapy.swap(false, Ordering::SeqCst) {
                Err(DeviceErrorCode::AlreadyStopTherapy)
            } else {
                Ok(())
            }
        }
    };

    Some(match outcome {
        Ok(()) => ack_frame(packet.id()),
        Err(code) => error_frame(packet.id(), code),
    })
}

/// Command acknowledgment: a Command-type frame whose payload byte is 0.
fn ack_frame(id: u8) -> Vec<u8> {
    frame(PacketType::Command, id, &[0x00])
}

fn error_frame(id: u8, code: DeviceErrorCode) -> Vec<u8> {
    frame(PacketType::Error, id, &[code.as_byte()])
}

fn frame(packet_type: PacketType, id: u8, payload: &[u8]) -> Vec<u8> {
    Packet::new(packet_type, id, payload.to_vec())
        .expect("emulator payloads are always 1..=254 bytes")
        .encode()
}

/// Deterministic two-tone test signal; repeatable across runs so captures
/// can be diffed.
fn next_sample_frame(seq: &mut u8, ts: &mut u32, idx: &mut u64, step_ms: u32) -> Vec<u8> {
    let t = *idx as f64;
    let voltage_mv = 130.0 * (t * 0.29).sin() + 40.0 * (t * 0.043).sin();
    let payload = stream_payload(*ts, encode_reading(voltage_mv));
    let bytes = frame(PacketType::StreamData, *seq, &payload);
    *seq = seq.wrapping_add(1);
    *ts = ts.wrapping_add(step_ms);
    *idx += 1;
    bytes
}
