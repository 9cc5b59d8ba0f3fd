//! Consolidated metrics records
//!
//! One [`ConsolidatedRecord`] is produced per harvest tick. It carries the
//! drained value and the last sampling error of every registered collector.
//! Records are built through a [`RecordBuilder`] that each collector fills in
//! during the harvest, then handed to the sinks by shared reference.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::SampleError;

/// Drained round-trip time of one ping target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetReading {
    /// Short name used in column headers (`obs`, `google`, ...)
    pub label: String,
    pub host: String,
    /// Maximum RTT over the epoch, `None` when no reply arrived
    pub rtt: Option<Duration>,
    pub error: Option<SampleError>,
}

impl TargetReading {
    /// RTT in milliseconds, blank when the epoch had an error or no replies
    pub fn rtt_ms(&self) -> Option<f64> {
        if self.error.is_some() {
            return None;
        }
        self.rtt
            .filter(|rtt| !rtt.is_zero())
            .map(|rtt| rtt.as_secs_f64() * 1000.0)
    }
}

/// Drained stream counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamReading {
    pub active: bool,
    /// Bytes sent since the previous record
    pub output_bytes: u64,
    /// Frames skipped since the previous record
    pub skipped_frames: u64,
    /// Frames output since the previous record
    pub total_frames: u64,
    pub error: Option<SampleError>,
}

/// Drained CPU and memory maxima
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageReading {
    pub cpu_percent: f64,
    /// Megabytes for the stream process, percent for the host
    pub memory: f64,
    pub error: Option<SampleError>,
}

/// Everything the monitor knows about one harvest tick
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedRecord {
    pub timestamp: DateTime<Utc>,
    /// In registration order, the stream server first
    pub targets: Vec<TargetReading>,
    pub stream: StreamReading,
    pub stream_process: UsageReading,
    pub system: UsageReading,
}

impl ConsolidatedRecord {
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn target(&self, label: &str) -> Option<&TargetReading> {
        self.targets.iter().find(|t| t.label == label)
    }

    pub fn target_labels(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.label.clone()).collect()
    }

    /// Every error in the record, keyed by the field group it belongs to
    pub fn errors(&self) -> Vec<(String, &SampleError)> {
        let mut errors: Vec<(String, &SampleError)> = self
            .targets
            .iter()
            .filter_map(|t| t.error.as_ref().map(|e| (format!("{}_ping", t.label), e)))
            .collect();
        if let Some(e) = &self.stream.error {
            errors.push(("stream".to_string(), e));
        }
        if let Some(e) = &self.stream_process.error {
            errors.push(("obs_stats".to_string(), e));
        }
        if let Some(e) = &self.system.error {
            errors.push(("system".to_string(), e));
        }
        errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }
}

/// Accumulates collector readings for one harvest tick
#[derive(Debug)]
pub struct RecordBuilder {
    timestamp: DateTime<Utc>,
    targets: Vec<TargetReading>,
    stream: StreamReading,
    stream_process: UsageReading,
    system: UsageReading,
}

impl RecordBuilder {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            targets: Vec::new(),
            stream: StreamReading::default(),
            stream_process: UsageReading::default(),
            system: UsageReading::default(),
        }
    }

    pub fn target(&mut self, reading: TargetReading) -> &mut Self {
        self.targets.push(reading);
        self
    }

    pub fn stream(&mut self, reading: StreamReading) -> &mut Self {
        self.stream = reading;
        self
    }

    pub fn stream_process(&mut self, reading: UsageReading) -> &mut Self {
        self.stream_process = reading;
        self
    }

    pub fn system(&mut self, reading: UsageReading) -> &mut Self {
        self.system = reading;
        self
    }

    pub fn build(self) -> ConsolidatedRecord {
        ConsolidatedRecord {
            timestamp: self.timestamp,
            targets: self.targets,
            stream: self.stream,
            stream_process: self.stream_process,
            system: self.system,
        }
    }
}
