//! Error handling for the OBS monitor
//!
//! Errors are split by how far they are allowed to travel. Sampling errors
//! never leave their collector except through a drained record, sink errors
//! never leave their sink, and only configuration errors and stream-control
//! failures during startup unwind past the harvester.

use std::io;

use thiserror::Error;

/// The main error type for the monitor
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Streaming-control client errors
    #[error("Stream control error: {0}")]
    StreamControl(#[from] StreamControlError),

    /// Output sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    /// Lifecycle errors (starting twice, shutting down a stopped harvester)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// A single failed sample.
///
/// Carried inside drained readings and records, so it has to be cheap to
/// clone and comparable in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("no response received")]
    NoResponse,

    #[error("ping failed: {reason}")]
    Probe { reason: String },

    #[error("probe timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("{0}")]
    StreamControl(String),

    #[error("system stats unavailable: {reason}")]
    SystemStats { reason: String },
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Sampling interval of {collector} ({sampling_ms}ms) exceeds writer interval ({writer_ms}ms)")]
    IntervalOrder {
        collector: String,
        sampling_ms: u64,
        writer_ms: u64,
    },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },

    #[error("Configuration directory could not be determined")]
    NoConfigDir,
}

/// Streaming-control client errors
#[derive(Error, Debug, Clone)]
pub enum StreamControlError {
    #[error("connection failed: {reason}")]
    Connection { reason: String },

    #[error("authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("request {request_type} failed with code {code}: {comment}")]
    RequestFailed {
        request_type: String,
        code: i64,
        comment: String,
    },

    #[error("request {request_type} timed out")]
    Timeout { request_type: String },

    #[error("connection closed")]
    Closed,

    #[error("stream server URL not found in settings")]
    MissingServer,

    #[error("no hostname found in URL: {url}")]
    InvalidServerUrl { url: String },
}

/// Output sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to create {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("write failed: {0}")]
    Io(#[from] io::Error),

    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("sink {name} is closed")]
    Closed { name: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MonitorError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for stream-control requests
pub type ControlResult<T> = std::result::Result<T, StreamControlError>;

/// A specialized result type for sink writes
pub type SinkResult<T> = std::result::Result<T, SinkError>;

impl MonitorError {
    /// Whether this error should stop the process
    pub fn is_fatal(&self) -> bool {
        match self {
            MonitorError::Config(_) => true,
            MonitorError::StreamControl(StreamControlError::Authentication { .. }) => true,
            MonitorError::StreamControl(StreamControlError::Connection { .. }) => true,
            MonitorError::Sink(SinkError::Create { .. }) => true,
            MonitorError::Lifecycle(_) => true,
            MonitorError::Io(io_error) => {
                !matches!(io_error.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::StreamControl(_) => "stream_control",
            MonitorError::Sink(_) => "sink",
            MonitorError::Io(_) => "io",
            MonitorError::Serialization(_) => "serialization",
            MonitorError::Lifecycle(_) => "lifecycle",
            MonitorError::Generic(_) => "generic",
        }
    }

    /// Process exit code for the binary
    pub fn exit_code(&self) -> i32 {
        match self {
            MonitorError::Config(_) => 2,
            MonitorError::StreamControl(StreamControlError::Authentication { .. }) => 3,
            MonitorError::StreamControl(_) => 4,
            MonitorError::Sink(_) => 5,
            _ => 1,
        }
    }
}

impl From<StreamControlError> for SampleError {
    fn from(err: StreamControlError) -> Self {
        SampleError::StreamControl(err.to_string())
    }
}

impl From<String> for MonitorError {
    fn from(msg: String) -> Self {
        MonitorError::Generic(msg)
    }
}

impl From<&str> for MonitorError {
    fn from(msg: &str) -> Self {
        MonitorError::Generic(msg.to_string())
    }
}
