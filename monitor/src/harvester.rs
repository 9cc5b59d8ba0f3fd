//! Periodic consolidation of collector state into records
//!
//! The harvester owns the writer cadence. On every tick it drains each
//! registered collector once, builds a [`ConsolidatedRecord`], and hands it
//! to every sink in registration order. The lifecycle is a one-way state
//! machine:
//!
//! ```text
//! Idle --start--> Running --shutdown--> ShuttingDown --sinks closed--> Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ConfigError, ConfigResult, MonitorError, Result};
use crate::output::MetricsSink;
use crate::record::{ConsolidatedRecord, RecordBuilder};

/// A collector the harvester can drain
pub trait Harvest: Send + Sync {
    fn name(&self) -> &str;

    fn sampling_interval(&self) -> Duration;

    /// Drain once and add the reading to the record being built
    fn harvest_into(&self, record: &mut RecordBuilder);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvesterState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for HarvesterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HarvesterState::Idle => "idle",
            HarvesterState::Running => "running",
            HarvesterState::ShuttingDown => "shutting down",
            HarvesterState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Counters kept over the harvester's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub ticks: u64,
    pub records_written: u64,
    pub sink_failures: u64,
}

pub struct Harvester {
    writer_interval: Duration,
    collectors: Vec<Arc<dyn Harvest>>,
    sinks: Vec<Box<dyn MetricsSink>>,
    stats: HarvestStats,
    state: watch::Sender<HarvesterState>,
}

impl Harvester {
    pub fn new(writer_interval: Duration) -> Self {
        let (state, _) = watch::channel(HarvesterState::Idle);
        Self {
            writer_interval,
            collectors: Vec::new(),
            sinks: Vec::new(),
            stats: HarvestStats::default(),
            state,
        }
    }

    pub fn writer_interval(&self) -> Duration {
        self.writer_interval
    }

    pub fn register(&mut self, collector: Arc<dyn Harvest>) {
        debug!(collector = collector.name(), "collector registered");
        self.collectors.push(collector);
    }

    pub fn add_sink(&mut self, sink: Box<dyn MetricsSink>) {
        debug!(sink = sink.name(), "sink added");
        self.sinks.push(sink);
    }

    pub fn state(&self) -> HarvesterState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> HarvestStats {
        self.stats
    }

    /// Every collector must sample at least once per harvest
    pub fn validate(&self) -> ConfigResult<()> {
        if self.writer_interval.is_zero() {
            return Err(ConfigError::ValidationFailed {
                reason: "writer interval must be greater than zero".to_string(),
            });
        }
        for collector in &self.collectors {
            if collector.sampling_interval() > self.writer_interval {
                return Err(ConfigError::IntervalOrder {
                    collector: collector.name().to_string(),
                    sampling_ms: collector.sampling_interval().as_millis() as u64,
                    writer_ms: self.writer_interval.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Drain every collector once and dispatch the record to every sink
    pub fn harvest_once(&mut self) -> ConsolidatedRecord {
        let mut builder = RecordBuilder::new(Utc::now());
        for collector in &self.collectors {
            collector.harvest_into(&mut builder);
        }
        let record = builder.build();
        self.stats.ticks += 1;

        for sink in self.sinks.iter_mut() {
            match sink.write(&record) {
                Ok(()) => self.stats.records_written += 1,
                Err(e) => {
                    self.stats.sink_failures += 1;
                    error!(sink = sink.name(), error = %e, "Failed to write metrics");
                }
            }
        }
        record
    }

    /// Validate the interval precondition and start ticking
    pub fn start(self, cancel: CancellationToken) -> Result<HarvesterHandle> {
        let current = self.state();
        if current != HarvesterState::Idle {
            return Err(MonitorError::Lifecycle(format!(
                "cannot start harvester that is {current}"
            )));
        }
        self.validate()?;

        let state = self.state.subscribe();
        self.transition(HarvesterState::Running);
        info!(
            collectors = self.collectors.len(),
            sinks = self.sinks.len(),
            writer_interval_ms = self.writer_interval.as_millis() as u64,
            "Harvester started"
        );

        let task = tokio::spawn(self.run(cancel.clone()));
        Ok(HarvesterHandle {
            cancel,
            state,
            task: Some(task),
        })
    }

    async fn run(mut self, cancel: CancellationToken) -> HarvestStats {
        let mut ticker = interval(self.writer_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.harvest_once();
                }
            }
        }

        self.transition(HarvesterState::ShuttingDown);
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.close() {
                error!(sink = sink.name(), error = %e, "Failed to close sink");
            }
        }
        self.transition(HarvesterState::Stopped);

        info!(
            ticks = self.stats.ticks,
            records_written = self.stats.records_written,
            sink_failures = self.stats.sink_failures,
            "Harvester stopped"
        );
        self.stats
    }

    fn transition(&self, next: HarvesterState) {
        let previous = self.state.send_replace(next);
        debug!(from = %previous, to = %next, "harvester state changed");
    }
}

/// Control handle for a running harvester
pub struct HarvesterHandle {
    cancel: CancellationToken,
    state: watch::Receiver<HarvesterState>,
    task: Option<JoinHandle<HarvestStats>>,
}

impl HarvesterHandle {
    pub fn state(&self) -> HarvesterState {
        *self.state.borrow()
    }

    /// Token whose cancellation stops the harvester
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve once the harvester has reached `Stopped`
    pub async fn stopped(&mut self) {
        // A closed channel means the task is gone, which only happens after Stopped
        let _ = self
            .state
            .wait_for(|state| *state == HarvesterState::Stopped)
            .await;
    }

    /// Stop ticking, close every sink, and return the final counters.
    ///
    /// No tick starts after this is called; a tick already in progress
    /// finishes first.
    pub async fn shutdown(&mut self) -> Result<HarvestStats> {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return Err(MonitorError::Lifecycle(
                "harvester already shut down".to_string(),
            ));
        };
        task.await
            .map_err(|e| MonitorError::Lifecycle(format!("harvester task failed: {e}")))
    }
}
