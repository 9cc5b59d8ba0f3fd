//! Stream-control seam and the collectors it feeds
//!
//! [`StreamControl`] is everything the monitor needs from the streaming
//! application: output counters, the configured ingest server, version
//! strings, process stats, and a notification when the session ends. The
//! obs-websocket client implements it in production; tests use mocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::collector::{Accumulator, Collector, DeltaTracker};
use crate::error::{ControlResult, SampleError};
use crate::harvester::Harvest;
use crate::record::{RecordBuilder, StreamReading};
use crate::sampler::{ProbeMode, SampleSource, SamplerGroup};
use crate::system_stats::UsageSample;

/// Output counters as reported by the streaming application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub active: bool,
    pub output_bytes: u64,
    pub skipped_frames: u64,
    pub total_frames: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Ingest server URL, possibly without a scheme
    pub server_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub app_version: String,
    pub protocol_version: String,
}

/// CPU and memory of the streaming application's own process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessStats {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Notifications pushed by the streaming application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The application is exiting or the connection dropped
    SessionEnded { reason: String },
}

#[async_trait]
pub trait StreamControl: Send + Sync {
    async fn stream_status(&self) -> ControlResult<StreamStatus>;

    async fn stream_settings(&self) -> ControlResult<StreamSettings>;

    async fn version(&self) -> ControlResult<VersionInfo>;

    async fn process_stats(&self) -> ControlResult<ProcessStats>;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Close the connection; the default does nothing
    async fn disconnect(&self) {}
}

/// Three output counters and the last active flag, drained under one lock
#[derive(Debug, Default)]
pub struct StreamTracker {
    bytes: DeltaTracker<u64>,
    skipped: DeltaTracker<u64>,
    total: DeltaTracker<u64>,
    active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDrain {
    pub active: bool,
    pub output_bytes: u64,
    pub skipped_frames: u64,
    pub total_frames: u64,
    pub sample_count: u64,
}

impl Accumulator for StreamTracker {
    type Sample = StreamStatus;
    type Reading = StreamDrain;

    fn record(&mut self, status: StreamStatus) {
        self.bytes.record(status.output_bytes);
        self.skipped.record(status.skipped_frames);
        self.total.record(status.total_frames);
        self.active = status.active;
    }

    fn drain(&mut self) -> StreamDrain {
        let bytes = self.bytes.drain();
        let skipped = self.skipped.drain();
        let total = self.total.drain();
        StreamDrain {
            active: self.active,
            output_bytes: bytes.delta,
            skipped_frames: skipped.delta,
            total_frames: total.delta,
            sample_count: bytes.sample_count,
        }
    }
}

pub struct StreamStatusSource {
    control: Arc<dyn StreamControl>,
}

impl StreamStatusSource {
    pub fn new(control: Arc<dyn StreamControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl SampleSource for StreamStatusSource {
    type Sample = StreamStatus;

    async fn sample(&self) -> Result<StreamStatus, SampleError> {
        Ok(self.control.stream_status().await?)
    }
}

/// Feeds the stream process's usage collector from `process_stats`
pub struct ProcessStatsSource {
    control: Arc<dyn StreamControl>,
}

impl ProcessStatsSource {
    pub fn new(control: Arc<dyn StreamControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl SampleSource for ProcessStatsSource {
    type Sample = UsageSample;

    async fn sample(&self) -> Result<UsageSample, SampleError> {
        let stats = self.control.process_stats().await?;
        Ok(UsageSample {
            cpu_percent: stats.cpu_percent,
            memory: stats.memory_mb,
        })
    }
}

pub struct StreamCollector {
    collector: Arc<Collector<StreamTracker>>,
}

impl StreamCollector {
    pub fn new(sampling_interval: Duration) -> Self {
        Self {
            collector: Arc::new(Collector::new("stream", sampling_interval)),
        }
    }

    pub fn collector(&self) -> &Arc<Collector<StreamTracker>> {
        &self.collector
    }

    pub fn spawn(&self, group: &mut SamplerGroup, control: Arc<dyn StreamControl>) {
        let source = Arc::new(StreamStatusSource::new(control));
        group.spawn(Arc::clone(&self.collector), source, ProbeMode::Inline);
    }

    pub fn drain(&self) -> StreamReading {
        let drained = self.collector.drain();
        StreamReading {
            active: drained.reading.active,
            output_bytes: drained.reading.output_bytes,
            skipped_frames: drained.reading.skipped_frames,
            total_frames: drained.reading.total_frames,
            error: drained.error,
        }
    }
}

impl Harvest for StreamCollector {
    fn name(&self) -> &str {
        self.collector.name()
    }

    fn sampling_interval(&self) -> Duration {
        self.collector.sampling_interval()
    }

    fn harvest_into(&self, record: &mut RecordBuilder) {
        record.stream(self.drain());
    }
}
