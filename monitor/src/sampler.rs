//! Periodic sampling loops
//!
//! Every collector gets its own task that ticks at the collector's sampling
//! interval, asks a [`SampleSource`] for one observation, and folds the
//! outcome into the collector. Ticks that fall behind are skipped rather than
//! bursted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::select;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collector::{Accumulator, Collector};
use crate::error::SampleError;

/// Something that can produce one observation on demand
#[async_trait]
pub trait SampleSource: Send + Sync + 'static {
    type Sample: Send + 'static;

    async fn sample(&self) -> Result<Self::Sample, SampleError>;
}

/// How a sampling loop runs its probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Await each probe before waiting for the next tick
    Inline,
    /// Spawn each probe so a slow one never delays the next tick
    Detached,
}

/// Spawn the sampling loop for one collector
pub fn spawn_sampler<A, S>(
    collector: Arc<Collector<A>>,
    source: Arc<S>,
    mode: ProbeMode,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    A: Accumulator<Sample = S::Sample> + 'static,
    S: SampleSource,
{
    tokio::spawn(run_sampler(collector, source, mode, cancel))
}

async fn run_sampler<A, S>(
    collector: Arc<Collector<A>>,
    source: Arc<S>,
    mode: ProbeMode,
    cancel: CancellationToken,
) where
    A: Accumulator<Sample = S::Sample> + 'static,
    S: SampleSource,
{
    let mut ticker = interval(collector.sampling_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; sampling starts one interval in.
    ticker.tick().await;

    let mut in_flight = JoinSet::new();
    debug!(
        collector = collector.name(),
        interval_ms = collector.sampling_interval().as_millis() as u64,
        ?mode,
        "sampler started"
    );

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match mode {
                ProbeMode::Inline => {
                    let outcome = source.sample().await;
                    collector.record(outcome);
                }
                ProbeMode::Detached => {
                    let collector = Arc::clone(&collector);
                    let source = Arc::clone(&source);
                    in_flight.spawn(async move {
                        let outcome = source.sample().await;
                        collector.record(outcome);
                    });
                }
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(collector = collector.name(), "probe task panicked");
                    }
                }
            }
        }
    }

    in_flight.abort_all();
    debug!(collector = collector.name(), "sampler stopped");
}

/// The set of running sampling loops owned by one monitor
pub struct SamplerGroup {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SamplerGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    /// Token the group's loops stop on
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<A, S>(&mut self, collector: Arc<Collector<A>>, source: Arc<S>, mode: ProbeMode)
    where
        A: Accumulator<Sample = S::Sample> + 'static,
        S: SampleSource,
    {
        let handle = spawn_sampler(collector, source, mode, self.cancel.clone());
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every loop and wait for them to finish; loops still running
    /// after `grace` are aborted
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for mut handle in self.handles {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "sampler task failed"),
                Err(_) => {
                    warn!("sampler did not stop within {:?}, aborting", grace);
                    handle.abort();
                }
            }
        }
    }
}
