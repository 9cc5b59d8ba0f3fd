//! Configuration management for the OBS monitor
//!
//! Configuration is layered, lowest precedence first: built-in defaults, a
//! TOML file, `OBS_MONITOR_*` environment variables, and command line flags.
//! Validation runs once all layers are applied.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "OBS_MONITOR_";

/// Main configuration structure for the monitor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Streaming application connection
    pub obs: ObsConfig,

    /// Sampling and writer cadence
    pub sampling: SamplingConfig,

    /// Ping targets
    pub ping: PingConfig,

    /// Output sinks
    pub output: OutputConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// obs-websocket connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsConfig {
    pub host: String,
    pub port: u16,

    /// Never written back to disk
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// How often every collector samples, in milliseconds
    pub metric_interval_ms: u64,

    /// How often a consolidated record is written, in milliseconds
    pub writer_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Hosts pinged alongside the stream server
    pub reference_hosts: Vec<String>,

    /// Wait for a single echo reply, in milliseconds
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Print the table to stdout
    pub console: bool,

    /// Colour errors in the console table
    pub colored: bool,

    /// CSV destination; `None` disables CSV output
    pub csv_path: Option<PathBuf>,

    /// Queue length in front of each sink; 0 writes synchronously
    pub buffer_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Emit JSON log lines
    pub json: bool,

    /// Also write logs to this file
    pub file_path: Option<PathBuf>,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4455,
            password: None,
            request_timeout_ms: 5000,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            metric_interval_ms: 1000,
            writer_interval_ms: 1000,
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            reference_hosts: vec!["google.com".to_string()],
            timeout_ms: 1000,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            console: true,
            colored: true,
            csv_path: Some(PathBuf::from("obs-monitor.csv")),
            buffer_capacity: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_path: None,
        }
    }
}

impl SamplingConfig {
    pub fn metric_interval(&self) -> Duration {
        Duration::from_millis(self.metric_interval_ms)
    }

    pub fn writer_interval(&self) -> Duration {
        Duration::from_millis(self.writer_interval_ms)
    }
}

impl ObsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: String) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: format!("{ENV_PREFIX}{name}"),
        value,
    })
}

impl MonitorConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_string_lossy().to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = MonitorConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `OBS_MONITOR_*` variables from the process environment
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Apply overrides looked up by variable name without the prefix
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.obs.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.obs.port = parse_env("PORT", port)?;
        }
        if let Some(password) = lookup("PASSWORD") {
            self.obs.password = Some(password);
        }
        if let Some(csv) = lookup("CSV") {
            self.output.csv_path = if csv.is_empty() {
                None
            } else {
                Some(PathBuf::from(csv))
            };
        }
        if let Some(interval) = lookup("METRIC_INTERVAL_MS") {
            self.sampling.metric_interval_ms = parse_env("METRIC_INTERVAL_MS", interval)?;
        }
        if let Some(interval) = lookup("WRITER_INTERVAL_MS") {
            self.sampling.writer_interval_ms = parse_env("WRITER_INTERVAL_MS", interval)?;
        }
        if let Some(hosts) = lookup("REFERENCE_HOSTS") {
            self.ping.reference_hosts = hosts
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Defaults, then the file if it exists, then the environment
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = MonitorConfig::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = MonitorConfig::from_file(path)?;
            }
        }

        config.apply_env()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.obs.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "obs.host".to_string(),
                value: self.obs.host.clone(),
            });
        }

        if self.obs.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "obs.port".to_string(),
                value: "0".to_string(),
            });
        }

        if self.obs.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "obs.request_timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if self.sampling.metric_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sampling.metric_interval_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if self.sampling.writer_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sampling.writer_interval_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if self.sampling.metric_interval_ms > self.sampling.writer_interval_ms {
            return Err(ConfigError::IntervalOrder {
                collector: "metrics".to_string(),
                sampling_ms: self.sampling.metric_interval_ms,
                writer_ms: self.sampling.writer_interval_ms,
            });
        }

        if self.ping.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ping.timeout_ms".to_string(),
                value: "0".to_string(),
            });
        }

        if let Some(host) = self.ping.reference_hosts.iter().find(|h| h.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "ping.reference_hosts".to_string(),
                value: format!("{host:?}"),
            });
        }

        let mut labels: Vec<(String, &str)> = Vec::new();
        for host in &self.ping.reference_hosts {
            let label = crate::pinger::target_label(host);
            if label == "obs" {
                return Err(ConfigError::ValidationFailed {
                    reason: "reference host label \"obs\" is reserved for the stream server"
                        .to_string(),
                });
            }
            if let Some((_, first)) = labels.iter().find(|(l, _)| *l == label) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!(
                        "reference hosts {first} and {host} share the column label \"{label}\""
                    ),
                });
            }
            labels.push((label, host.as_str()));
        }

        if let Some(path) = &self.output.csv_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "output.csv_path".to_string(),
                    value: String::new(),
                });
            }
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("obs-monitor").join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Save configuration to a TOML file; the password is never written
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::ValidationFailed {
                reason: format!("Unable to create config directory: {}", parent.display()),
            })?;
        }

        fs::write(path, self.to_toml()?).map_err(|e| ConfigError::ValidationFailed {
            reason: format!("Unable to write {}: {}", path.display(), e),
        })
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }
}
