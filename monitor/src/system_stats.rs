//! Host and stream-process resource usage
//!
//! CPU and memory are tracked as a pair of rolling maxima under one lock by
//! [`UsageCollector`]. The same collector type serves the host (fed by
//! [`SystemStats`]) and the streaming application's own process (fed by the
//! stream-control `GetStats` request).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;

use crate::collector::{Accumulator, Collector, MaxTracker};
use crate::error::SampleError;
use crate::harvester::Harvest;
use crate::record::{RecordBuilder, UsageReading};
use crate::sampler::{ProbeMode, SampleSource, SamplerGroup};

/// Host-wide CPU and memory utilisation
pub trait SystemStats: Send + Sync {
    /// CPU utilisation across all cores, 0-100
    fn cpu_percent(&self) -> Result<f64, SampleError>;

    /// Used memory as a share of total memory, 0-100
    fn memory_percent(&self) -> Result<f64, SampleError>;
}

/// [`SystemStats`] backed by `sysinfo`
pub struct SysinfoStats {
    system: Mutex<System>,
}

impl SysinfoStats {
    /// Create the reader and take the first CPU measurement so the next one
    /// covers a real interval
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemStats for SysinfoStats {
    fn cpu_percent(&self) -> Result<f64, SampleError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu();
        let usage = f64::from(system.global_cpu_info().cpu_usage());
        if !usage.is_finite() {
            return Err(SampleError::SystemStats {
                reason: "CPU usage is not a number".to_string(),
            });
        }
        Ok(usage)
    }

    fn memory_percent(&self) -> Result<f64, SampleError> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(SampleError::SystemStats {
                reason: "total memory reported as zero".to_string(),
            });
        }
        Ok(system.used_memory() as f64 / total as f64 * 100.0)
    }
}

/// One CPU + memory observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    pub cpu_percent: f64,
    pub memory: f64,
}

/// Rolling maxima of CPU and memory, drained together
#[derive(Debug, Default)]
pub struct UsageTracker {
    cpu: MaxTracker<f64>,
    memory: MaxTracker<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageDrain {
    pub cpu_percent: f64,
    pub memory: f64,
    pub sample_count: u64,
}

impl Accumulator for UsageTracker {
    type Sample = UsageSample;
    type Reading = UsageDrain;

    fn record(&mut self, sample: UsageSample) {
        self.cpu.record(sample.cpu_percent);
        self.memory.record(sample.memory);
    }

    fn drain(&mut self) -> UsageDrain {
        let cpu = self.cpu.drain();
        let memory = self.memory.drain();
        UsageDrain {
            cpu_percent: cpu.max,
            memory: memory.max,
            sample_count: cpu.sample_count,
        }
    }
}

/// Reads the host's usage off the runtime's worker threads
pub struct SystemUsageSource {
    stats: Arc<dyn SystemStats>,
}

impl SystemUsageSource {
    pub fn new(stats: Arc<dyn SystemStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl SampleSource for SystemUsageSource {
    type Sample = UsageSample;

    async fn sample(&self) -> Result<UsageSample, SampleError> {
        let stats = Arc::clone(&self.stats);
        tokio::task::spawn_blocking(move || {
            Ok(UsageSample {
                cpu_percent: stats.cpu_percent()?,
                memory: stats.memory_percent()?,
            })
        })
        .await
        .map_err(|e| SampleError::SystemStats {
            reason: e.to_string(),
        })?
    }
}

/// Whose usage a [`UsageCollector`] tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageScope {
    /// The streaming application's process, memory in MB
    StreamProcess,
    /// The whole host, memory in percent
    System,
}

impl UsageScope {
    fn collector_name(self) -> &'static str {
        match self {
            UsageScope::StreamProcess => "obs stats",
            UsageScope::System => "system",
        }
    }
}

/// Paired CPU/memory rolling maxima for one [`UsageScope`]
pub struct UsageCollector {
    scope: UsageScope,
    collector: Arc<Collector<UsageTracker>>,
}

impl UsageCollector {
    pub fn new(scope: UsageScope, sampling_interval: Duration) -> Self {
        Self {
            scope,
            collector: Arc::new(Collector::new(scope.collector_name(), sampling_interval)),
        }
    }

    pub fn scope(&self) -> UsageScope {
        self.scope
    }

    pub fn collector(&self) -> &Arc<Collector<UsageTracker>> {
        &self.collector
    }

    pub fn spawn<S>(&self, group: &mut SamplerGroup, source: Arc<S>)
    where
        S: SampleSource<Sample = UsageSample>,
    {
        group.spawn(Arc::clone(&self.collector), source, ProbeMode::Inline);
    }

    pub fn drain(&self) -> UsageReading {
        let drained = self.collector.drain();
        UsageReading {
            cpu_percent: drained.reading.cpu_percent,
            memory: drained.reading.memory,
            error: drained.error,
        }
    }
}

impl Harvest for UsageCollector {
    fn name(&self) -> &str {
        self.collector.name()
    }

    fn sampling_interval(&self) -> Duration {
        self.collector.sampling_interval()
    }

    fn harvest_into(&self, record: &mut RecordBuilder) {
        let reading = self.drain();
        match self.scope {
            UsageScope::StreamProcess => record.stream_process(reading),
            UsageScope::System => record.system(reading),
        };
    }
}
