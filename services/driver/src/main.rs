// driver: operator CLI for the stimulation-device host driver.
//
// Opens a session on the selected serial port, then takes single-letter
// commands on stdin: S toggles streaming, T toggles the operator therapy
// enable, Q quits.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use driver::config::DriverConfig;
use driver::events::{ConnectionStatus, StreamingStatus};
use driver::port::{available_ports, SerialOpener};
use driver::Session;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "driver", about = "Stimulation device host driver")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Serial port to use, overriding the config and the interactive picker.
    #[arg(long)]
    port: Option<String>,
    /// List available serial ports and exit.
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.list_ports {
        for name in available_ports() {
            println!("{name}");
        }
        return;
    }

    let cfg = match &args.config {
        Some(path) => match driver::load_config(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("FATAL: {e}");
                std::process::exit(1);
            }
        },
        None => DriverConfig::default(),
    };

    let Some(port_name) = args.port.clone().or_else(|| cfg.port.name.clone()).or_else(pick_port)
    else {
        eprintln!("no serial port selected");
        std::process::exit(1);
    };

    let opener = Arc::new(SerialOpener { baud: cfg.port.baud });
    let mut session = Session::new(cfg, opener);

    // Mirror session events into the log so the operator sees reconnects
    // and therapy changes as they happen.
    let events = session.events();
    let mut connection_rx = events.subscribe_connection();
    tokio::spawn(async move {
        while let Ok(status) = connection_rx.recv().await {
            info!(?status, "connection status");
        }
    });
    let mut therapy_rx = events.subscribe_therapy();
    tokio::spawn(async move {
        while let Ok(needed) = therapy_rx.recv().await {
            info!(needed, "therapy requirement");
        }
    });

    match session.open(&port_name).await {
        ConnectionStatus::Connected => {}
        status => {
            error!(?status, port = %port_name, "could not open session");
            std::process::exit(1);
        }
    }

    println!("connected to {port_name}  —  S: toggle streaming, T: toggle therapy, Q: quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim().to_ascii_uppercase().as_str() {
            "S" => {
                if session.is_streaming() {
                    session.stop_streaming().await;
                    println!("streaming stopped");
                } else {
                    match session.start_streaming().await {
                        StreamingStatus::Streaming => {
                            match session.stream_log_path() {
                                Some(path) => println!("streaming to {}", path.display()),
                                None => println!("streaming"),
                            }
                        }
                        status => warn!(?status, "start streaming refused"),
                    }
                }
            }
            "T" => {
                let enabled = !session.therapy_enabled();
                session.set_therapy_enabled(enabled);
                println!("therapy {}", if enabled { "enabled" } else { "disabled" });
            }
            "Q" => break,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }

    session.close().await;
}

/// Interactive port picker on stdin.
fn pick_port() -> Option<String> {
    let ports = available_ports();
    if ports.is_empty() {
        eprintln!("no serial ports found");
        return None;
    }
    println!("select a port:");
    for (index, name) in ports.iter().enumerate() {
        println!("  [{index}] {name}");
    }
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    let index: usize = line.trim().parse().ok()?;
    ports.get(index).cloned()
}
