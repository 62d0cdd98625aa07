//! Session lifecycle against the emulated device.

mod common;

use common::{test_config, SimOpener};
use driver::events::ConnectionStatus;
use driver::Session;
use emulator::{FaultPlan, SimConfig};
use std::time::Duration;

#[tokio::test]
async fn open_connects_and_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let opener = SimOpener::new(vec![SimConfig::default()]);
    let mut session = Session::new(test_config(dir.path()), opener.clone());

    assert_eq!(session.open("sim0").await, ConnectionStatus::Connected);
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(opener.device_state(0).connected.load(std::sync::atomic::Ordering::SeqCst));

    // A second open on a live session is refused.
    assert_eq!(session.open("sim0").await, ConnectionStatus::AlreadyConnected);

    session.close().await;
    assert_eq!(session.status(), ConnectionStatus::Closed);
    session.close().await;
    assert_eq!(session.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn open_with_missing_port_returns_no_device() {
    let dir = tempfile::tempdir().unwrap();
    let opener = SimOpener::with_failures(vec![SimConfig::default()], vec![0]);
    let mut session = Session::new(test_config(dir.path()), opener);

    assert_eq!(session.open("sim0").await, ConnectionStatus::NoDevice);
    assert_eq!(session.status(), ConnectionStatus::NoDevice);
}

#[tokio::test]
async fn open_fails_when_the_device_never_answers() {
    let dir = tempfile::tempdir().unwrap();
    let opener = SimOpener::new(vec![SimConfig {
        faults: FaultPlan {
            drop_replies: vec![stim_protocol::OpCode::InitialConnection],
            ..FaultPlan::default()
        },
        ..SimConfig::default()
    }]);
    let mut session = Session::new(test_config(dir.path()), opener);

    let started = std::time::Instant::now();
    assert_eq!(session.open("sim0").await, ConnectionStatus::Failed);
    // 3 attempts x (100 ms timeout + 100 ms retry delay) plus slack.
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn streaming_requires_an_open_session() {
    let dir = tempfile::tempdir().unwrap();
    let opener = SimOpener::new(vec![SimConfig::default()]);
    let mut session = Session::new(test_config(dir.path()), opener);

    assert_eq!(
        session.start_streaming().await,
        driver::StreamingStatus::ConnectionNotOpen
    );
    // Stop without start must be a no-op.
    session.stop_streaming().await;
}
