//! Session lifecycle.
//!
//! Closed → Opening → Connected ⇄ Disconnected → Closed. The session owns
//! every component: the dispatcher and transport are created at `open` and
//! live until `close`; the streaming controller (and with it the therapy
//! monitor) lives from `start_streaming` to `stop_streaming`, spanning any
//! number of reconnects; the watchdog runs from the first successful
//! handshake until `close`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DriverConfig;
use crate::dispatcher::Dispatcher;
use crate::events::{ConnectionStatus, EventBus, StreamingStatus};
use crate::link::PortLink;
use crate::port::PortOpener;
use crate::reconnect::{self, ReconnectConfig};
use crate::streaming::StreamingController;
use crate::transport::Transport;
use crate::util::join_bounded;
use crate::watchdog::{self, WatchdogSettings};

struct OpenState {
    shutdown: watch::Sender<bool>,
    dispatcher: Dispatcher,
    dispatcher_task: Option<JoinHandle<()>>,
    transport: Arc<Transport>,
    link: Arc<PortLink>,
    watchdog_task: Option<JoinHandle<()>>,
    streaming: Option<StreamingController>,
}

pub struct Session {
    cfg: DriverConfig,
    opener: Arc<dyn PortOpener>,
    events: Arc<EventBus>,
    therapy_enabled: AtomicBool,
    open_state: Option<OpenState>,
}

impl Session {
    pub fn new(cfg: DriverConfig, opener: Arc<dyn PortOpener>) -> Self {
        let therapy_enabled = AtomicBool::new(cfg.therapy.enabled_on_start);
        Session {
            cfg,
            opener,
            events: Arc::new(EventBus::new()),
            therapy_enabled,
            open_state: None,
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.events.current_status()
    }

    pub fn is_streaming(&self) -> bool {
        self.open_state
            .as_ref()
            .is_some_and(|s| s.streaming.is_some())
    }

    /// Path of the active stream log, if streaming.
    pub fn stream_log_path(&self) -> Option<std::path::PathBuf> {
        self.open_state
            .as_ref()
            .and_then(|s| s.streaming.as_ref())
            .map(|c| c.log_path().to_owned())
    }

    fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            connection_attempts: self.cfg.link.connection_attempts,
            retry_delay: self.cfg.command_timeout(),
            bad_port_retry_delay: self.cfg.bad_port_retry_delay(),
        }
    }

    /// Open the port, start the inbound pipeline, and perform the handshake.
    pub async fn open(&mut self, port_name: &str) -> ConnectionStatus {
        if self.open_state.is_some() {
            return ConnectionStatus::AlreadyConnected;
        }
        info!(port = port_name, "opening session");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (dispatcher, dispatcher_task) =
            Dispatcher::start(self.cfg.link.queue_depth, shutdown_rx.clone());
        let transport = Arc::new(Transport::new(dispatcher.clone(), self.cfg.command_timeout()));
        let link = Arc::new(PortLink::new(
            Arc::clone(&self.opener),
            port_name,
            self.cfg.read_timeout(),
            Arc::clone(&transport),
            dispatcher.sender(),
        ));

        if let Err(e) = link.connect().await {
            warn!(port = port_name, error = %e, "port setup failed");
            let _ = shutdown.send(true);
            join_bounded("dispatcher", dispatcher_task).await;
            self.events.emit_connection(ConnectionStatus::NoDevice);
            return ConnectionStatus::NoDevice;
        }

        let mut handshake_shutdown = shutdown_rx.clone();
        match reconnect::handshake(&transport, &self.reconnect_config(), &mut handshake_shutdown)
            .await
        {
            Ok(()) => {
                let watchdog_task = watchdog::spawn(
                    Arc::clone(&transport),
                    Arc::clone(&link),
                    Arc::clone(&self.events),
                    WatchdogSettings {
                        feed_interval: self.cfg.feed_interval(),
                        attempts: self.cfg.watchdog.attempts,
                        reconnect: self.reconnect_config(),
                    },
                    shutdown_rx,
                );
                self.open_state = Some(OpenState {
                    shutdown,
                    dispatcher,
                    dispatcher_task: Some(dispatcher_task),
                    transport,
                    link,
                    watchdog_task: Some(watchdog_task),
                    streaming: None,
                });
                info!(port = port_name, "session connected");
                self.events.emit_connection(ConnectionStatus::Connected);
                ConnectionStatus::Connected
            }
            Err(e) => {
                warn!(port = port_name, error = %e, "handshake failed");
                link.disconnect().await;
                let _ = shutdown.send(true);
                join_bounded("dispatcher", dispatcher_task).await;
                self.events.emit_connection(ConnectionStatus::Failed);
                ConnectionStatus::Failed
            }
        }
    }

    /// Activate streaming. Idempotent; requires a connected session.
    pub async fn start_streaming(&mut self) -> StreamingStatus {
        let Some(state) = self.open_state.as_mut() else {
            return StreamingStatus::ConnectionNotOpen;
        };
        if state.streaming.is_some() {
            return StreamingStatus::AlreadyStreaming;
        }
        if self.events.current_status() != ConnectionStatus::Connected {
            return StreamingStatus::ConnectionNotOpen;
        }
        match StreamingController::start(
            state.dispatcher.clone(),
            Arc::clone(&state.transport),
            Arc::clone(&self.events),
            &self.cfg.stream_log,
            self.therapy_enabled.load(Ordering::SeqCst),
        )
        .await
        {
            Ok(controller) => {
                state.streaming = Some(controller);
                StreamingStatus::Streaming
            }
            Err(e) => {
                warn!(error = %e, "failed to start streaming");
                StreamingStatus::NotStreaming
            }
        }
    }

    /// Deactivate streaming. Safe to call when not streaming.
    pub async fn stop_streaming(&mut self) {
        if let Some(controller) = self
            .open_state
            .as_mut()
            .and_then(|state| state.streaming.take())
        {
            controller.stop().await;
        }
    }

    /// Operator therapy toggle; takes effect immediately when streaming.
    pub fn set_therapy_enabled(&self, enabled: bool) {
        self.therapy_enabled.store(enabled, Ordering::SeqCst);
        if let Some(controller) = self
            .open_state
            .as_ref()
            .and_then(|state| state.streaming.as_ref())
        {
            controller.set_therapy_enabled(enabled);
        }
    }

    pub fn therapy_enabled(&self) -> bool {
        self.therapy_enabled.load(Ordering::SeqCst)
    }

    /// Close everything: streaming, watchdog, dispatcher, then the port.
    /// Idempotent.
    pub async fn close(&mut self) {
        self.stop_streaming().await;
        let Some(mut state) = self.open_state.take() else {
            return;
        };
        let _ = state.shutdown.send(true);
        if let Some(task) = state.watchdog_task.take() {
            join_bounded("watchdog", task).await;
        }
        if let Some(task) = state.dispatcher_task.take() {
            join_bounded("dispatcher", task).await;
        }
        state.link.disconnect().await;
        self.events.emit_connection(ConnectionStatus::Closed);
        info!("session closed");
    }
}
