//! Session event surface.
//!
//! All outward-facing notifications go through one hub owned by the session:
//! broadcast channels for fire-and-forget fan-out (a slow subscriber can
//! never stall the link) plus a `watch` mirror of the current connection
//! status for internal precondition checks.

use seizure_core::SeizureClassification;
use stim_protocol::StreamingSample;
use tokio::sync::{broadcast, watch};

/// Connection lifecycle as visible to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unopened,
    Connected,
    AlreadyConnected,
    NoDevice,
    Disconnected,
    Closed,
    Failed,
}

/// Outcome of a start-streaming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingStatus {
    NotStreaming,
    Streaming,
    AlreadyStreaming,
    ConnectionNotOpen,
}

pub struct EventBus {
    connection_tx: broadcast::Sender<ConnectionStatus>,
    sample_tx: broadcast::Sender<StreamingSample>,
    classification_tx: broadcast::Sender<SeizureClassification>,
    therapy_tx: broadcast::Sender<bool>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl EventBus {
    pub fn new() -> Self {
        let (connection_tx, _) = broadcast::channel(64);
        let (sample_tx, _) = broadcast::channel(1024);
        let (classification_tx, _) = broadcast::channel(64);
        let (therapy_tx, _) = broadcast::channel(16);
        let (status_tx, _) = watch::channel(ConnectionStatus::Unopened);
        EventBus {
            connection_tx,
            sample_tx,
            classification_tx,
            therapy_tx,
            status_tx,
        }
    }

    /// Publish a connection-status change. Never blocks; subscribers that
    /// lag simply miss intermediate transitions.
    pub fn emit_connection(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
        let _ = self.connection_tx.send(status);
    }

    pub fn emit_sample(&self, sample: StreamingSample) {
        let _ = self.sample_tx.send(sample);
    }

    pub fn emit_classification(&self, classification: SeizureClassification) {
        let _ = self.classification_tx.send(classification);
    }

    /// Publish a change of the hysteresis "therapy needed" output.
    pub fn emit_therapy(&self, needed: bool) {
        let _ = self.therapy_tx.send(needed);
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.connection_tx.subscribe()
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<StreamingSample> {
        self.sample_tx.subscribe()
    }

    pub fn subscribe_classifications(&self) -> broadcast::Receiver<SeizureClassification> {
        self.classification_tx.subscribe()
    }

    pub fn subscribe_therapy(&self) -> broadcast::Receiver<bool> {
        self.therapy_tx.subscribe()
    }

    /// Current connection status, always up to date.
    pub fn current_status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
