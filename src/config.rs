use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

/// Longest accepted survey interval, one day.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Snapshot output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Write every snapshot to stdout
    pub log_output: bool,
    /// Snapshots a sink may have queued before new ones are dropped for it
    pub sink_queue_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            log_output: true,
            sink_queue_capacity: 100,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address clients connect to
    pub listen_addr: String,
    /// Survey interval in seconds
    pub interval_secs: u64,
    /// How long a survey waits for stragglers, in milliseconds.
    /// Must be shorter than the interval.
    pub timeout_ms: u64,
    /// Outbound messages a session may have queued before it is dropped
    pub send_queue_capacity: usize,
    /// Deadline for a single socket write, in milliseconds
    pub write_timeout_ms: u64,
    /// Time sessions get to close after a shutdown broadcast, in milliseconds
    pub shutdown_grace_ms: u64,
    /// Largest accepted frame body
    pub max_frame_bytes: usize,

    pub log: LogConfig,
    pub output: OutputConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "127.0.0.1:5865".to_string(),
            interval_secs: 10,
            timeout_ms: 1000,
            send_queue_capacity: 8,
            write_timeout_ms: 1000,
            shutdown_grace_ms: 500,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            log: LogConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse TOML. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid("interval_secs must be positive".into()));
        }
        if self.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "interval_secs ({}) must be at most {}",
                self.interval_secs, MAX_INTERVAL_SECS
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".into()));
        }
        if self.timeout() >= self.interval() {
            return Err(ConfigError::Invalid(format!(
                "timeout_ms ({}) must be shorter than the interval ({}s)",
                self.timeout_ms, self.interval_secs
            )));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "send_queue_capacity must be positive".into(),
            ));
        }
        if self.output.sink_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "output.sink_queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.log.json = json;
        self
    }

    pub fn with_log_output(mut self, enabled: bool) -> Self {
        self.output.log_output = enabled;
        self
    }

    /// Get the survey interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Get the survey timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Inactivity after which a session pings its peer
    pub fn ping_after(&self) -> Duration {
        self.interval() / 2
    }

    /// Inactivity after which a session is considered dead
    pub fn idle_deadline(&self) -> Duration {
        self.interval().saturating_mul(2)
    }
}
