//! Rolling-window accumulators shared by every collector
//!
//! A collector is an [`Accumulator`] behind a single mutex together with the
//! last sampling error of the current epoch. The sampling loop is the only
//! writer and the harvester is the only reader; [`Collector::drain`] is the
//! atomic read-and-reset that closes one sampling epoch and opens the next.
//!
//! Two accumulators cover every metric the monitor reports:
//!
//! - [`MaxTracker`]: running maximum of a gauge (CPU, memory, RTT)
//! - [`DeltaTracker`]: running maximum of a monotonic counter, reported as
//!   the increase since the previous drain (bytes sent, frames)
//!
//! Composite collectors (stream status, CPU + memory pairs) implement
//! [`Accumulator`] over several trackers so that all their fields are drained
//! under one lock.

use std::ops::Sub;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::SampleError;

/// Per-epoch state that can be fed samples and drained.
///
/// Implementations are plain data; locking is the job of [`Collector`].
pub trait Accumulator: Send {
    /// Value produced by one successful sample
    type Sample;

    /// Value reported by one drain
    type Reading;

    /// Fold one sample into the current epoch
    fn record(&mut self, sample: Self::Sample);

    /// Report the current epoch and start the next one
    fn drain(&mut self) -> Self::Reading;
}

/// Result of draining a [`MaxTracker`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxReading<T> {
    /// Largest sample seen since the previous drain, or `T::default()`
    pub max: T,

    /// Total number of samples since creation (never reset)
    pub sample_count: u64,
}

/// Running maximum of a gauge.
#[derive(Debug, Default, Clone)]
pub struct MaxTracker<T> {
    current_max: T,
    sample_count: u64,
}

impl<T> MaxTracker<T>
where
    T: PartialOrd + Copy + Default,
{
    pub fn new() -> Self {
        Self {
            current_max: T::default(),
            sample_count: 0,
        }
    }

    pub fn current_max(&self) -> T {
        self.current_max
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

impl<T> Accumulator for MaxTracker<T>
where
    T: PartialOrd + Copy + Default + Send,
{
    type Sample = T;
    type Reading = MaxReading<T>;

    fn record(&mut self, value: T) {
        // NaN compares false and is ignored
        if value > self.current_max {
            self.current_max = value;
        }
        self.sample_count += 1;
    }

    fn drain(&mut self) -> MaxReading<T> {
        MaxReading {
            max: std::mem::take(&mut self.current_max),
            sample_count: self.sample_count,
        }
    }
}

/// Result of draining a [`DeltaTracker`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaReading<T> {
    /// Counter increase since the previous drain
    pub delta: T,

    /// Baseline after this drain (the counter value the next delta starts from)
    pub baseline: T,

    /// Total number of samples since creation (never reset)
    pub sample_count: u64,
}

/// Running maximum of a monotonic counter, drained as a delta.
///
/// The first observation of a counter is an arbitrary absolute offset, so
/// while fewer than two samples have ever been recorded a drain reports a
/// zero delta and only moves the baseline.
#[derive(Debug, Default, Clone)]
pub struct DeltaTracker<T> {
    current_max: T,
    baseline: T,
    sample_count: u64,
    epoch_samples: u64,
}

impl<T> DeltaTracker<T>
where
    T: PartialOrd + Copy + Default + Sub<Output = T>,
{
    pub fn new() -> Self {
        Self {
            current_max: T::default(),
            baseline: T::default(),
            sample_count: 0,
            epoch_samples: 0,
        }
    }

    pub fn baseline(&self) -> T {
        self.baseline
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

impl<T> Accumulator for DeltaTracker<T>
where
    T: PartialOrd + Copy + Default + Sub<Output = T> + Send,
{
    type Sample = T;
    type Reading = DeltaReading<T>;

    fn record(&mut self, value: T) {
        if value > self.current_max {
            self.current_max = value;
        }
        self.sample_count += 1;
        self.epoch_samples += 1;
    }

    fn drain(&mut self) -> DeltaReading<T> {
        // An empty epoch observed nothing new: the counter still sits at the baseline.
        let observed = if self.epoch_samples == 0 {
            self.baseline
        } else {
            self.current_max
        };

        // A counter that went backwards was reset upstream; its new value is a
        // fresh offset, not a rate.
        let delta = if self.sample_count < 2 || observed < self.baseline {
            T::default()
        } else {
            observed - self.baseline
        };

        self.baseline = observed;
        self.current_max = T::default();
        self.epoch_samples = 0;

        DeltaReading {
            delta,
            baseline: observed,
            sample_count: self.sample_count,
        }
    }
}

/// What one drain of a [`Collector`] returns
#[derive(Debug, Clone, PartialEq)]
pub struct Drained<R> {
    pub reading: R,
    pub error: Option<SampleError>,
}

struct Epoch<A> {
    accumulator: A,
    last_error: Option<SampleError>,
}

/// Lock-protected accumulator plus the last error of the running epoch.
pub struct Collector<A> {
    name: String,
    sampling_interval: Duration,
    epoch: Mutex<Epoch<A>>,
}

/// Running-maximum collector for gauges
pub type RollingMaxCollector<T> = Collector<MaxTracker<T>>;

/// Delta collector for monotonic counters
pub type DeltaCounterCollector<T> = Collector<DeltaTracker<T>>;

impl<A> Collector<A>
where
    A: Accumulator,
{
    /// Create a collector with a fresh accumulator
    pub fn new(name: impl Into<String>, sampling_interval: Duration) -> Self
    where
        A: Default,
    {
        Self::with_accumulator(name, sampling_interval, A::default())
    }

    /// Create a collector around an existing accumulator
    pub fn with_accumulator(
        name: impl Into<String>,
        sampling_interval: Duration,
        accumulator: A,
    ) -> Self {
        Self {
            name: name.into(),
            sampling_interval,
            epoch: Mutex::new(Epoch {
                accumulator,
                last_error: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sampling_interval(&self) -> Duration {
        self.sampling_interval
    }

    /// Fold a successful sample into the current epoch
    pub fn record_sample(&self, sample: A::Sample) {
        self.lock().accumulator.record(sample);
    }

    /// Remember a failed sample; accumulated values are kept
    pub fn record_error(&self, error: SampleError) {
        self.lock().last_error = Some(error);
    }

    /// Record the outcome of one sampling attempt
    pub fn record(&self, outcome: Result<A::Sample, SampleError>) {
        match outcome {
            Ok(sample) => self.record_sample(sample),
            Err(error) => {
                tracing::debug!(collector = %self.name, error = %error, "sample failed");
                self.record_error(error);
            }
        }
    }

    /// Atomically report and reset the current epoch
    pub fn drain(&self) -> Drained<A::Reading> {
        let mut epoch = self.lock();
        let reading = epoch.accumulator.drain();
        let error = epoch.last_error.take();
        Drained { reading, error }
    }

    // A panic while holding the lock cannot leave the scalar fields half
    // written, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Epoch<A>> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A> std::fmt::Debug for Collector<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("name", &self.name)
            .field("sampling_interval", &self.sampling_interval)
            .finish_non_exhaustive()
    }
}
