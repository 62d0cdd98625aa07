//! Therapy control loop.
//!
//! The monitor task accumulates streaming samples into a sliding window,
//! schedules classifier evaluations off the sample path, and runs the
//! hysteresis state machine over the resulting verdicts. Start/stop therapy
//! commands are dispatched to self-retrying workers that re-check their
//! preconditions on every round, so a stale worker dies quietly instead of
//! fighting a newer decision.
//!
//! Note: `in_seizure` tracks the latest classification label directly,
//! while the therapy decision comes from the hysteresis output. The two can
//! disagree near the decision boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use seizure_core::{classify, SeizureClassification, EVAL_STRIDE, WINDOW};
use stim_protocol::{DeviceErrorCode, OpCode, StreamingSample};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{ConnectionStatus, EventBus};
use crate::transport::Transport;
use crate::util::{join_bounded, sleep_cancellable};

/// Accumulated confidence needed to enter the "therapy needed" state.
const SEIZURE_START: f64 = 1.0;
/// Accumulated confidence needed to leave it.
const SEIZURE_OVER: f64 = 3.0;
/// Timestamp jump that marks a stream discontinuity.
const TIME_GAP_ALLOWED_MS: u32 = 10;
/// Delay between therapy command retries.
const RETRY_DELAY: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Window accumulation
// ---------------------------------------------------------------------------

/// Sliding window over the incoming samples. Returns a snapshot whenever
/// the window is full and the sample counter sits a multiple of the stride
/// past the first full window.
struct WindowAccumulator {
    buffer: VecDeque<f64>,
    count: u64,
    last_ts: Option<u32>,
}

impl WindowAccumulator {
    fn new() -> Self {
        WindowAccumulator {
            buffer: VecDeque::with_capacity(WINDOW),
            count: 0,
            last_ts: None,
        }
    }

    fn push(&mut self, sample: StreamingSample) -> Option<[f64; WINDOW]> {
        if let Some(last) = self.last_ts {
            if sample.timestamp_ms.abs_diff(last) > TIME_GAP_ALLOWED_MS {
                debug!(
                    last,
                    now = sample.timestamp_ms,
                    "stream discontinuity; restarting window"
                );
                self.buffer.clear();
                self.count = 0;
            }
        }
        self.last_ts = Some(sample.timestamp_ms);

        if self.buffer.len() == WINDOW {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample.voltage_mv);
        self.count += 1;

        let full = WINDOW as u64;
        if self.count >= full && (self.count - full) % EVAL_STRIDE as u64 == 0 {
            let mut window = [0.0f64; WINDOW];
            for (slot, value) in window.iter_mut().zip(self.buffer.iter()) {
                *slot = *value;
            }
            Some(window)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Hysteresis
// ---------------------------------------------------------------------------

/// Confidence-accumulation rule that keeps therapy from toggling rapidly
/// near the decision boundary.
struct Hysteresis {
    needed: bool,
    accum: f64,
}

impl Hysteresis {
    fn new() -> Self {
        Hysteresis {
            needed: false,
            accum: 0.0,
        }
    }

    /// Apply one verdict. Returns the new state when it flips.
    fn apply(&mut self, label: bool, confidence: f64) -> Option<bool> {
        if label == self.needed {
            // Agreement decays any pending evidence for a change.
            self.accum = (self.accum - confidence).max(0.0);
            return None;
        }
        self.accum += confidence;
        let threshold = if self.needed { SEIZURE_OVER } else { SEIZURE_START };
        if self.accum >= threshold {
            self.needed = !self.needed;
            self.accum = 0.0;
            Some(self.needed)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Shared flags
// ---------------------------------------------------------------------------

/// State shared between the monitor task, command workers, and the stream
/// log row builder.
pub(crate) struct TherapyShared {
    /// Operator toggle: therapy commands are only issued while enabled.
    pub(crate) enabled: AtomicBool,
    /// Last known device-side therapy state.
    pub(crate) active: AtomicBool,
    /// Hysteresis output.
    pub(crate) needed: AtomicBool,
    /// Latest classification label, before hysteresis.
    pub(crate) in_seizure: AtomicBool,
    pub(crate) disposed: AtomicBool,
}

impl TherapyShared {
    fn new(enabled: bool) -> Self {
        TherapyShared {
            enabled: AtomicBool::new(enabled),
            active: AtomicBool::new(false),
            needed: AtomicBool::new(false),
            in_seizure: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn in_seizure(&self) -> bool {
        self.in_seizure.load(Ordering::SeqCst)
    }

    pub(crate) fn therapy_needed(&self) -> bool {
        self.needed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// TherapyMonitor
// ---------------------------------------------------------------------------

enum Control {
    SetEnabled(bool),
}

pub struct TherapyMonitor {
    sample_tx: mpsc::Sender<StreamingSample>,
    control_tx: mpsc::UnboundedSender<Control>,
    shared: Arc<TherapyShared>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TherapyMonitor {
    pub(crate) fn start(transport: Arc<Transport>, events: Arc<EventBus>, enabled: bool) -> Self {
        let shared = Arc::new(TherapyShared::new(enabled));
        let (sample_tx, sample_rx) = mpsc::channel(1024);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_monitor(
            transport,
            events,
            Arc::clone(&shared),
            sample_rx,
            control_rx,
            shutdown_rx,
        ));
        TherapyMonitor {
            sample_tx,
            control_tx,
            shared,
            shutdown,
            task,
        }
    }

    /// Non-blocking sample path used by the StreamData listener.
    pub(crate) fn sample_sender(&self) -> mpsc::Sender<StreamingSample> {
        self.sample_tx.clone()
    }

    pub(crate) fn shared(&self) -> Arc<TherapyShared> {
        Arc::clone(&self.shared)
    }

    /// Operator therapy toggle.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        let _ = self.control_tx.send(Control::SetEnabled(enabled));
    }

    pub(crate) async fn stop(self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        join_bounded("therapy monitor", self.task).await;
    }
}

async fn run_monitor(
    transport: Arc<Transport>,
    events: Arc<EventBus>,
    shared: Arc<TherapyShared>,
    mut sample_rx: mpsc::Receiver<StreamingSample>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut accumulator = WindowAccumulator::new();
    let mut hysteresis = Hysteresis::new();
    let (verdict_tx, mut verdict_rx) = mpsc::channel::<SeizureClassification>(64);
    let mut status = events.watch_status();

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = status.changed() => {
                if changed.is_ok() && *status.borrow() == ConnectionStatus::Connected {
                    // Commands halted by a disconnect resume here.
                    resync_commands(&transport, &events, &shared, &shutdown);
                }
            }
            Some(control) = control_rx.recv() => match control {
                Control::SetEnabled(enabled) => {
                    shared.enabled.store(enabled, Ordering::SeqCst);
                    info!(enabled, "operator therapy toggle");
                    if enabled {
                        if shared.needed.load(Ordering::SeqCst) && !shared.active.load(Ordering::SeqCst) {
                            spawn_therapy_command(true, &transport, &events, &shared, &shutdown);
                        }
                    } else if shared.active.load(Ordering::SeqCst) {
                        spawn_therapy_command(false, &transport, &events, &shared, &shutdown);
                    }
                }
            },
            Some(verdict) = verdict_rx.recv() => {
                shared.in_seizure.store(verdict.label, Ordering::SeqCst);
                events.emit_classification(verdict);
                if let Some(needed) = hysteresis.apply(verdict.label, f64::from(verdict.confidence)) {
                    shared.needed.store(needed, Ordering::SeqCst);
                    info!(needed, "therapy requirement changed");
                    events.emit_therapy(needed);
                    if needed {
                        if shared.enabled.load(Ordering::SeqCst) {
                            spawn_therapy_command(true, &transport, &events, &shared, &shutdown);
                        }
                    } else if shared.active.load(Ordering::SeqCst) {
                        spawn_therapy_command(false, &transport, &events, &shared, &shutdown);
                    }
                }
            }
            Some(sample) = sample_rx.recv() => {
                if let Some(window) = accumulator.push(sample) {
                    // Classification runs off this task so the sample path
                    // is never blocked behind the FFT.
                    let tx = verdict_tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(classify(&window)).await;
                    });
                }
            }
        }
    }
    debug!("therapy monitor stopped");
}

/// Re-issue whichever therapy command the current state calls for.
fn resync_commands(
    transport: &Arc<Transport>,
    events: &Arc<EventBus>,
    shared: &Arc<TherapyShared>,
    shutdown: &watch::Receiver<bool>,
) {
    let needed = shared.needed.load(Ordering::SeqCst);
    let enabled = shared.enabled.load(Ordering::SeqCst);
    let active = shared.active.load(Ordering::SeqCst);
    if needed && enabled && !active {
        spawn_therapy_command(true, transport, events, shared, shutdown);
    } else if active && (!needed || !enabled) {
        spawn_therapy_command(false, transport, events, shared, shutdown);
    }
}

/// Worker that drives one start/stop intent to completion, retrying every
/// [`RETRY_DELAY`] until it succeeds or its preconditions no longer hold.
fn spawn_therapy_command(
    start: bool,
    transport: &Arc<Transport>,
    events: &Arc<EventBus>,
    shared: &Arc<TherapyShared>,
    shutdown: &watch::Receiver<bool>,
) {
    let transport = Arc::clone(transport);
    let shared = Arc::clone(shared);
    let status = events.watch_status();
    let mut shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if shared.disposed.load(Ordering::SeqCst) || *shutdown.borrow() {
                return;
            }
            if start {
                if !shared.needed.load(Ordering::SeqCst)
                    || !shared.enabled.load(Ordering::SeqCst)
                    || shared.active.load(Ordering::SeqCst)
                {
                    return;
                }
            } else {
                if !shared.active.load(Ordering::SeqCst) {
                    return;
                }
                // Stale stop: therapy is wanted again.
                if shared.needed.load(Ordering::SeqCst) && shared.enabled.load(Ordering::SeqCst) {
                    return;
                }
            }
            if *status.borrow() != ConnectionStatus::Connected {
                // Halt; the monitor re-issues on the next Connected event.
                debug!(start, "therapy command halted while disconnected");
                return;
            }

            let op = if start {
                OpCode::StartTherapy
            } else {
                OpCode::StopTherapy
            };
            match transport.send_command(op, &[]).await {
                Ok(()) => {
                    shared.active.store(start, Ordering::SeqCst);
                    info!(active = start, "therapy command acknowledged");
                    return;
                }
                Err(DeviceErrorCode::AlreadyDoingTherapy) if start => {
                    shared.active.store(true, Ordering::SeqCst);
                    return;
                }
                Err(DeviceErrorCode::AlreadyStopTherapy) if !start => {
                    shared.active.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    debug!(start, error = %e, "therapy command failed; retrying");
                    if sleep_cancellable(RETRY_DELAY, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    });
}
