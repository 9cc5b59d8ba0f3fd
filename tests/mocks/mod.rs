pub mod mock_sinks;
pub mod mock_stream_control;
pub mod mock_system_stats;

pub use mock_probe::MockProbe;
pub use mock_sinks::{FailingSink, RecordingSink};
pub use mock_stream_control::MockStreamControl;
pub use mock_system_stats::MockSystemStats;
