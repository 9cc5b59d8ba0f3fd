use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use obs_monitor::config::MonitorConfig;
use obs_monitor::error::{ConfigError, MonitorError, SampleError, StreamControlError};
use obs_monitor::harvester::HarvesterState;
use obs_monitor::monitor::{Collaborators, Monitor, MonitorStatus};

use crate::mocks::{FailingSink, MockProbe, MockStreamControl, MockSystemStats, RecordingSink};
use crate::test_setup;
use crate::test_utils::quiet_config;

const INGEST_URL: &str = "rtmp://a.rtmp.youtube.com/live2";
const INGEST_HOST: &str = "a.rtmp.youtube.com";

struct Fixture {
    control: Arc<MockStreamControl>,
    probe: Arc<MockProbe>,
    system: Arc<MockSystemStats>,
}

impl Fixture {
    fn new(server_url: &str) -> Self {
        Self {
            control: Arc::new(MockStreamControl::new(server_url)),
            probe: Arc::new(MockProbe::new().reply(INGEST_HOST, Duration::from_millis(35))),
            system: Arc::new(MockSystemStats::new(40.0, 55.0)),
        }
    }

    fn monitor(&self, config: MonitorConfig) -> Monitor {
        Monitor::new(
            config,
            Collaborators {
                control: self.control.clone(),
                probe: self.probe.clone(),
                system: self.system.clone(),
            },
        )
    }
}

#[tokio::test(start_paused = true)]
async fn test_monitor_runs_until_session_ends() -> Result<()> {
    test_setup!();

    let temp_dir = TempDir::new()?;
    let csv_path = temp_dir.path().join("obs-monitor.csv");
    let mut config = quiet_config(100, 300);
    config.output.csv_path = Some(csv_path.clone());

    let fixture = Fixture::new(INGEST_URL);
    let mut monitor = fixture.monitor(config);
    let recording = RecordingSink::new();
    monitor.add_sink(Box::new(recording.clone()));
    assert_eq!(monitor.status(), MonitorStatus::Created);
    assert_eq!(monitor.harvester_state(), HarvesterState::Idle);

    let session = monitor.start().await?;
    assert_eq!(monitor.status(), MonitorStatus::Running);
    assert_eq!(monitor.harvester_state(), HarvesterState::Running);
    assert_eq!(session.stream_host, INGEST_HOST);
    assert_eq!(session.version.app_version, "30.1.2");
    let labels: Vec<&str> = session.targets.iter().map(|t| t.label.as_str()).collect();
    assert_eq!(labels, vec!["obs", "google"]);
    assert_eq!(
        session.outputs,
        vec![format!("csv:{}", csv_path.display()), "recording".to_string()]
    );

    // Harvests at 300, 600 and 900ms
    tokio::time::sleep(Duration::from_millis(1000)).await;
    fixture.control.end_session("OBS is exiting");
    tokio::time::timeout(Duration::from_secs(5), monitor.wait()).await?;
    assert_eq!(monitor.harvester_state(), HarvesterState::Stopped);

    let stats = monitor.shutdown().await?;
    assert_eq!(monitor.status(), MonitorStatus::Stopped);
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.records_written, 6);
    assert_eq!(stats.sink_failures, 0);
    assert!(fixture.control.was_disconnected());
    assert!(recording.is_closed());

    let records = recording.records();
    assert_eq!(records.len(), 3);
    for record in &records {
        let obs = record.target("obs").expect("stream server column");
        assert_eq!(obs.host, INGEST_HOST);
        assert!((obs.rtt_ms().expect("obs rtt") - 35.0).abs() < 1e-6);
        let google = record.target("google").expect("reference column");
        assert!((google.rtt_ms().expect("google rtt") - 20.0).abs() < 1e-6);

        assert!(record.stream.active);
        assert!(record.stream.output_bytes > 0);
        assert_eq!(record.stream_process.cpu_percent, 12.5);
        assert_eq!(record.stream_process.memory, 512.0);
        assert!(record.stream_process.error.is_none());
    }
    assert!(fixture.probe.pings(INGEST_HOST) >= 9);
    assert!(fixture.control.calls("GetStats") >= 9);

    let mut reader = csv::Reader::from_path(&csv_path)?;
    let headers = reader.headers()?.clone();
    assert!(headers.iter().any(|h| h == "obs_rtt_ms"));
    assert!(headers.iter().any(|h| h == "google_rtt_ms"));
    assert_eq!(reader.records().count(), 3);

    assert!(matches!(
        monitor.shutdown().await,
        Err(MonitorError::Lifecycle(_))
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_token_stops_monitor() -> Result<()> {
    test_setup!();

    let fixture = Fixture::new(INGEST_URL);
    let mut monitor = fixture.monitor(quiet_config(100, 200));
    let recording = RecordingSink::new();
    monitor.add_sink(Box::new(recording.clone()));
    monitor.start().await?;

    tokio::time::sleep(Duration::from_millis(450)).await;
    monitor.cancel_token().cancel();
    tokio::time::timeout(Duration::from_secs(5), monitor.wait()).await?;

    let stats = monitor.shutdown().await?;
    assert_eq!(stats.ticks, 2);
    assert_eq!(recording.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_start_rejects_metric_interval_above_writer_interval() {
    test_setup!();

    let fixture = Fixture::new(INGEST_URL);
    let mut monitor = fixture.monitor(quiet_config(2000, 1000));

    let result = monitor.start().await;
    assert!(matches!(
        result,
        Err(MonitorError::Config(ConfigError::IntervalOrder {
            sampling_ms: 2000,
            writer_ms: 1000,
            ..
        }))
    ));
    assert!(matches!(monitor.status(), MonitorStatus::Error(_)));
    assert_eq!(fixture.control.calls("GetVersion"), 0);
    assert!(matches!(monitor.start().await, Err(MonitorError::Lifecycle(_))));
}

#[tokio::test(start_paused = true)]
async fn test_start_fails_without_stream_server() {
    test_setup!();

    let fixture = Fixture::new("");
    let mut monitor = fixture.monitor(quiet_config(100, 300));

    let result = monitor.start().await;
    assert!(matches!(
        result,
        Err(MonitorError::StreamControl(StreamControlError::MissingServer))
    ));
    assert!(matches!(monitor.status(), MonitorStatus::Error(_)));
    assert_eq!(fixture.probe.pings(""), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stream_errors_and_sink_failures_do_not_stop_monitor() -> Result<()> {
    test_setup!();

    let fixture = Fixture::new(INGEST_URL);
    fixture.control.fail_status(Some(StreamControlError::Timeout {
        request_type: "GetStreamStatus".to_string(),
    }));

    let mut monitor = fixture.monitor(quiet_config(100, 300));
    let recording = RecordingSink::new();
    let failing = FailingSink::new();
    monitor.add_sink(Box::new(failing.clone()));
    monitor.add_sink(Box::new(recording.clone()));
    monitor.start().await?;

    tokio::time::sleep(Duration::from_millis(650)).await;
    let stats = monitor.shutdown().await?;

    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.sink_failures, 2);
    assert_eq!(stats.records_written, 2);
    assert_eq!(failing.attempts(), 2);

    for record in recording.records() {
        assert_eq!(
            record.stream.error,
            Some(SampleError::StreamControl(
                "request GetStreamStatus timed out".to_string()
            ))
        );
        assert_eq!(record.stream.output_bytes, 0);
        assert!(record.target("obs").and_then(|t| t.rtt_ms()).is_some());
        assert!(record.errors().iter().all(|(group, _)| group == "stream"));
    }
    Ok(())
}

/// A slow buffered output is flushed and closed before shutdown returns
#[tokio::test]
async fn test_shutdown_waits_for_buffered_outputs() -> Result<()> {
    test_setup!();

    let mut config = quiet_config(20, 50);
    config.output.buffer_capacity = 16;

    let fixture = Fixture::new(INGEST_URL);
    let mut monitor = fixture.monitor(config);
    let recording = RecordingSink::with_write_delay(Duration::from_millis(40));
    monitor.add_sink(Box::new(recording.clone()));
    monitor.start().await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = monitor.shutdown().await?;

    assert_eq!(monitor.status(), MonitorStatus::Stopped);
    assert!(stats.ticks >= 3);
    assert!(recording.is_closed());
    assert_eq!(recording.len() as u64, stats.ticks);
    Ok(())
}
