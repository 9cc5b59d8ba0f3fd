//! OBS stream monitor library
//!
//! Samples ping latency to the stream server and reference hosts, OBS output
//! counters, OBS process stats and host resource usage on one cadence, and
//! consolidates the per-interval maxima and counter deltas into records
//! written on another.

pub mod collector;
pub mod config;
pub mod error;
pub mod harvester;
pub mod monitor;
pub mod obs_client;
pub mod output;
pub mod pinger;
pub mod record;
pub mod sampler;
pub mod stream;
pub mod system_stats;

// Re-export commonly used types
pub use collector::{
    Accumulator, Collector, DeltaCounterCollector, DeltaTracker, Drained, MaxTracker,
    RollingMaxCollector,
};
pub use config::MonitorConfig;
pub use error::{MonitorError, Result, SampleError};
pub use harvester::{Harvest, HarvestStats, Harvester, HarvesterHandle, HarvesterState};
pub use monitor::{Collaborators, Monitor, MonitorStatus, SessionInfo};
pub use obs_client::{ConnectOptions, ObsClient};
pub use output::{BufferedSink, ConsoleWriter, CsvWriter, MetricsSink};
pub use pinger::{IcmpProbe, PingTarget, RttCollector, SystemPing};
pub use record::{ConsolidatedRecord, RecordBuilder, StreamReading, TargetReading, UsageReading};
pub use sampler::{ProbeMode, SampleSource, SamplerGroup};
pub use stream::{
    ProcessStats, SessionEvent, StreamCollector, StreamControl, StreamSettings, StreamStatus,
    VersionInfo,
};
pub use system_stats::{SysinfoStats, SystemStats, UsageCollector, UsageScope};
