//! Driver configuration loading.
//!
//! TOML is the sole config source. Every field is optional in the file and
//! falls back to a default, so an empty file (or no file at all) yields a
//! usable configuration for bench work.
//!
//! # Tables
//! - `[port]` — device path, baud rate, read timeout
//! - `[link]` — command timeout, handshake attempts, dispatch queue depth
//! - `[watchdog]` — feed interval, per-tick attempts, port-retry delay
//! - `[therapy]` — operator enable at startup
//! - `[stream_log]` — CSV output directory and filename stem

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Resolved config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub port: PortConfig,
    pub link: LinkConfig,
    pub watchdog: WatchdogConfig,
    pub therapy: TherapyConfig,
    pub stream_log: StreamLogConfig,
}

#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Device path, e.g. `/dev/ttyUSB0`. None means pick interactively.
    pub name: Option<String>,
    pub baud: u32,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub command_timeout_ms: u64,
    pub connection_attempts: u32,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub feed_interval_ms: u64,
    pub attempts: u32,
    pub bad_port_retry_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TherapyConfig {
    pub enabled_on_start: bool,
}

#[derive(Debug, Clone)]
pub struct StreamLogConfig {
    pub dir: String,
    pub stem: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            port: PortConfig {
                name: None,
                baud: 115_200,
                read_timeout_ms: 500,
            },
            link: LinkConfig {
                command_timeout_ms: 500,
                connection_attempts: 5,
                queue_depth: 64,
            },
            watchdog: WatchdogConfig {
                feed_interval_ms: 3000,
                attempts: 3,
                bad_port_retry_delay_ms: 3000,
            },
            therapy: TherapyConfig {
                enabled_on_start: false,
            },
            stream_log: StreamLogConfig {
                dir: ".".to_owned(),
                stem: "stream".to_owned(),
            },
        }
    }
}

impl DriverConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.link.command_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.port.read_timeout_ms)
    }

    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog.feed_interval_ms)
    }

    pub fn bad_port_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watchdog.bad_port_retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    port: Option<RawPortConfig>,
    link: Option<RawLinkConfig>,
    watchdog: Option<RawWatchdogConfig>,
    therapy: Option<RawTherapyConfig>,
    stream_log: Option<RawStreamLogConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPortConfig {
    name: Option<String>,
    baud: Option<u32>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLinkConfig {
    command_timeout_ms: Option<u64>,
    connection_attempts: Option<u32>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWatchdogConfig {
    feed_interval_ms: Option<u64>,
    attempts: Option<u32>,
    bad_port_retry_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTherapyConfig {
    enabled_on_start: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStreamLogConfig {
    dir: Option<String>,
    stem: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<DriverConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    resolve(raw)
}

fn resolve(raw: RawConfig) -> Result<DriverConfig, ConfigError> {
    let defaults = DriverConfig::default();
    let port = raw.port.unwrap_or_default();
    let link = raw.link.unwrap_or_default();
    let watchdog = raw.watchdog.unwrap_or_default();
    let therapy = raw.therapy.unwrap_or_default();
    let stream_log = raw.stream_log.unwrap_or_default();

    let cfg = DriverConfig {
        port: PortConfig {
            name: port.name,
            baud: port.baud.unwrap_or(defaults.port.baud),
            read_timeout_ms: port.read_timeout_ms.unwrap_or(defaults.port.read_timeout_ms),
        },
        link: LinkConfig {
            command_timeout_ms: link
                .command_timeout_ms
                .unwrap_or(defaults.link.command_timeout_ms),
            connection_attempts: link
                .connection_attempts
                .unwrap_or(defaults.link.connection_attempts),
            queue_depth: link.queue_depth.unwrap_or(defaults.link.queue_depth),
        },
        watchdog: WatchdogConfig {
            feed_interval_ms: watchdog
                .feed_interval_ms
                .unwrap_or(defaults.watchdog.feed_interval_ms),
            attempts: watchdog.attempts.unwrap_or(defaults.watchdog.attempts),
            bad_port_retry_delay_ms: watchdog
                .bad_port_retry_delay_ms
                .unwrap_or(defaults.watchdog.bad_port_retry_delay_ms),
        },
        therapy: TherapyConfig {
            enabled_on_start: therapy
                .enabled_on_start
                .unwrap_or(defaults.therapy.enabled_on_start),
        },
        stream_log: StreamLogConfig {
            dir: stream_log.dir.unwrap_or(defaults.stream_log.dir),
            stem: stream_log.stem.unwrap_or(defaults.stream_log.stem),
        },
    };

    if cfg.port.baud == 0 {
        return Err(ConfigError::Invalid {
            field: "port.baud",
            reason: "must be nonzero",
        });
    }
    if cfg.link.command_timeout_ms == 0 {
        return Err(ConfigError::Invalid {
            field: "link.command_timeout_ms",
            reason: "must be nonzero",
        });
    }
    if cfg.link.connection_attempts == 0 {
        return Err(ConfigError::Invalid {
            field: "link.connection_attempts",
            reason: "must be at least 1",
        });
    }
    if cfg.link.queue_depth == 0 {
        return Err(ConfigError::Invalid {
            field: "link.queue_depth",
            reason: "must be at least 1",
        });
    }
    if cfg.watchdog.feed_interval_ms == 0 {
        return Err(ConfigError::Invalid {
            field: "watchdog.feed_interval_ms",
            reason: "must be nonzero",
        });
    }
    if cfg.watchdog.attempts == 0 {
        return Err(ConfigError::Invalid {
            field: "watchdog.attempts",
            reason: "must be at least 1",
        });
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(text: &str) -> Result<DriverConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        load_config(file.path())
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = load_str("").unwrap();
        assert_eq!(cfg.port.baud, 115_200);
        assert_eq!(cfg.link.connection_attempts, 5);
        assert_eq!(cfg.watchdog.feed_interval_ms, 3000);
        assert!(!cfg.therapy.enabled_on_start);
    }

    #[test]
    fn fields_override_defaults() {
        let cfg = load_str(
            r#"
            [port]
            name = "/dev/ttyACM3"
            baud = 57600

            [watchdog]
            feed_interval_ms = 4000

            [therapy]
            enabled_on_start = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port.name.as_deref(), Some("/dev/ttyACM3"));
        assert_eq!(cfg.port.baud, 57_600);
        assert_eq!(cfg.watchdog.feed_interval_ms, 4000);
        assert!(cfg.therapy.enabled_on_start);
    }

    #[test]
    fn zero_attempts_is_rejected_with_field_name() {
        let err = load_str("[watchdog]\nattempts = 0\n").unwrap_err();
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "watchdog.attempts"),
            other => panic!("expected Invalid, got: {other}"),
        }
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            load_str("port = {"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
