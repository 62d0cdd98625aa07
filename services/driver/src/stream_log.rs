//! CSV capture of the streaming session.
//!
//! One row per sample: device timestamp, millivolts, the latest classifier
//! label, and the hysteresis "therapy needed" output. Rows travel over an
//! unbounded queue so the sample path never waits on the filesystem; the
//! writer task drains the queue and flushes on shutdown.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::StreamLogConfig;

const HEADER: &str = "'Timestamp','Value','InSeizure','TherapyState'\n";

/// One CSV row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogRow {
    pub timestamp_ms: u32,
    pub voltage_mv: f64,
    pub in_seizure: bool,
    pub therapy_needed: bool,
}

pub struct StreamLog {
    tx: mpsc::UnboundedSender<LogRow>,
    task: JoinHandle<()>,
    path: PathBuf,
}

impl StreamLog {
    /// Create the log file (collision-proof name) and start the writer.
    pub(crate) async fn create(cfg: &StreamLogConfig) -> std::io::Result<Self> {
        let (path, file) = open_unique(Path::new(&cfg.dir), &cfg.stem).await?;
        let mut writer = BufWriter::new(file);
        writer.write_all(HEADER.as_bytes()).await?;
        info!(path = %path.display(), "stream log started");

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(writer, rx));
        Ok(StreamLog { tx, task, path })
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<LogRow> {
        self.tx.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting rows, drain the queue, and flush.
    pub(crate) async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!(error = %e, "stream log writer ended abnormally");
        }
    }
}

async fn run_writer(mut writer: BufWriter<tokio::fs::File>, mut rx: mpsc::UnboundedReceiver<LogRow>) {
    while let Some(row) = rx.recv().await {
        let line = format!(
            "{},{},{},{}\n",
            row.timestamp_ms, row.voltage_mv, row.in_seizure, row.therapy_needed
        );
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, "stream log write failed; dropping remaining rows");
            break;
        }
    }
    if let Err(e) = writer.flush().await {
        warn!(error = %e, "stream log flush failed");
    }
}

/// Open `<dir>/<stem>-<utc>.csv`, appending `-1`, `-2`, ... until a fresh
/// file can be created.
async fn open_unique(dir: &Path, stem: &str) -> std::io::Result<(PathBuf, tokio::fs::File)> {
    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let base = format!("{stem}-{timestamp}");
    for attempt in 0..100u32 {
        let name = if attempt == 0 {
            format!("{base}.csv")
        } else {
            format!("{base}-{attempt}.csv")
        };
        let path = dir.join(name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::other("could not find a free stream log name"))
}
