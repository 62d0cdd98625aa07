#![allow(dead_code)] // each test binary uses a subset of the harness

//! Shared harness: a `PortOpener` backed by emulator instances over
//! in-memory duplex links. Each `open` call spins up a fresh device, so
//! reconnect scenarios can hand the driver a different device (or a
//! failure) per attempt.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use driver::config::DriverConfig;
use driver::port::{PortOpener, PortPair};
use emulator::{DeviceSim, SimConfig, SimHandle, SimState};

pub struct SimOpener {
    /// Per-open configs; the last entry is reused for later opens.
    configs: Vec<SimConfig>,
    /// Open indices (0-based) that fail as if the port were missing.
    fail_opens: Vec<usize>,
    opens: AtomicUsize,
    states: Mutex<Vec<Arc<SimState>>>,
    handles: Mutex<Vec<SimHandle>>,
}

impl SimOpener {
    pub fn new(configs: Vec<SimConfig>) -> Arc<Self> {
        Self::with_failures(configs, Vec::new())
    }

    pub fn with_failures(configs: Vec<SimConfig>, fail_opens: Vec<usize>) -> Arc<Self> {
        assert!(!configs.is_empty(), "need at least one sim config");
        Arc::new(SimOpener {
            configs,
            fail_opens,
            opens: AtomicUsize::new(0),
            states: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// State of the n-th spawned device (failed opens don't count).
    pub fn device_state(&self, index: usize) -> Arc<SimState> {
        Arc::clone(&self.states.lock().unwrap()[index])
    }

    pub fn device_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

impl PortOpener for SimOpener {
    fn open(&self, _name: &str) -> io::Result<PortPair> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_opens.contains(&n) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such port"));
        }
        let config = self
            .configs
            .get(n)
            .or_else(|| self.configs.last())
            .cloned()
            .expect("configs is non-empty");
        let (host, sim) = tokio::io::duplex(16 * 1024);
        let (sim_reader, sim_writer) = tokio::io::split(sim);
        let handle = DeviceSim::spawn(sim_reader, sim_writer, config);
        self.states.lock().unwrap().push(handle.state());
        self.handles.lock().unwrap().push(handle);
        let (reader, writer) = tokio::io::split(host);
        Ok(PortPair {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

/// Config with timeouts shrunk for tests; the stream log goes to `log_dir`.
pub fn test_config(log_dir: &std::path::Path) -> DriverConfig {
    let mut cfg = DriverConfig::default();
    cfg.port.read_timeout_ms = 50;
    cfg.link.command_timeout_ms = 100;
    cfg.link.connection_attempts = 3;
    cfg.watchdog.feed_interval_ms = 150;
    cfg.watchdog.attempts = 2;
    cfg.watchdog.bad_port_retry_delay_ms = 100;
    cfg.stream_log.dir = log_dir.display().to_string();
    cfg
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_for(
    what: &str,
    deadline: std::time::Duration,
    mut predicate: impl FnMut() -> bool,
) {
    let result = tokio::time::timeout(deadline, async {
        while !predicate() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}
