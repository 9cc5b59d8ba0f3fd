use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use obs_monitor::error::SampleError;
use obs_monitor::harvester::{Harvester, HarvesterState};
use obs_monitor::output::CsvWriter;
use obs_monitor::pinger::{PingTarget, RttCollector};
use obs_monitor::sampler::SamplerGroup;
use obs_monitor::stream::StreamCollector;

use crate::mocks::{FailingSink, MockProbe, MockStreamControl, RecordingSink};
use crate::test_setup;

const STREAM_HOST: &str = "live.example.com";
const BYTES_PER_STATUS: u64 = 125_000;

struct Pipeline {
    control: Arc<MockStreamControl>,
    probe: Arc<MockProbe>,
    stream: Arc<StreamCollector>,
    harvester: Harvester,
    samplers: SamplerGroup,
    cancel: CancellationToken,
}

/// Stream server unreachable, reference host and stream counters healthy
fn pipeline(metric: Duration, writer: Duration) -> Pipeline {
    let control = Arc::new(MockStreamControl::new(format!("rtmp://{STREAM_HOST}/app")));
    control.set_step(BYTES_PER_STATUS, 1, 3);
    let probe = Arc::new(
        MockProbe::new()
            .fail(STREAM_HOST, SampleError::NoResponse)
            .reply("google.com", Duration::from_millis(18)),
    );

    let obs = Arc::new(RttCollector::new(PingTarget::new("obs", STREAM_HOST), metric));
    let google = Arc::new(RttCollector::new(PingTarget::reference("google.com"), metric));
    let stream = Arc::new(StreamCollector::new(metric));

    let mut harvester = Harvester::new(writer);
    harvester.register(obs.clone());
    harvester.register(google.clone());
    harvester.register(stream.clone());

    let cancel = CancellationToken::new();
    let mut samplers = SamplerGroup::new(cancel.child_token());
    obs.spawn(&mut samplers, probe.clone(), Duration::from_secs(1));
    google.spawn(&mut samplers, probe.clone(), Duration::from_secs(1));
    stream.spawn(&mut samplers, control.clone());

    Pipeline {
        control,
        probe,
        stream,
        harvester,
        samplers,
        cancel,
    }
}

/// One collector failing every sample, two succeeding, one sink broken
#[tokio::test(start_paused = true)]
async fn test_failing_collector_and_sink_are_isolated() -> Result<()> {
    test_setup!();

    // 80ms never lines up with 450ms inside the run, so each epoch's sample
    // count is fixed
    let mut pipeline = pipeline(Duration::from_millis(80), Duration::from_millis(450));
    let recording = RecordingSink::new();
    let failing = FailingSink::new();
    pipeline.harvester.add_sink(Box::new(recording.clone()));
    pipeline.harvester.add_sink(Box::new(failing.clone()));

    let mut handle = pipeline.harvester.start(pipeline.cancel.clone())?;
    assert_eq!(handle.state(), HarvesterState::Running);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    pipeline.samplers.shutdown(Duration::from_secs(1)).await;
    let stats = handle.shutdown().await?;

    assert_eq!(handle.state(), HarvesterState::Stopped);
    assert_eq!(stats.ticks, 2);
    assert_eq!(stats.records_written, 2);
    assert_eq!(stats.sink_failures, 2);
    assert_eq!(failing.attempts(), 2);
    assert!(recording.is_closed());

    let records = recording.records();
    assert_eq!(records.len(), 2);
    for record in &records {
        let obs = record.target("obs").expect("stream server column");
        assert_eq!(obs.error, Some(SampleError::NoResponse));
        assert_eq!(obs.rtt_ms(), None);

        let google = record.target("google").expect("reference column");
        assert!(google.error.is_none());
        let rtt = google.rtt_ms().expect("reference rtt");
        assert!((rtt - 18.0).abs() < 1e-6);

        assert!(record.stream.error.is_none());
        assert!(record.stream.active);

        let errors = record.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "obs_ping");
    }

    // Samples at 80..400ms, then 480..880ms
    assert_eq!(records[0].stream.output_bytes, 5 * BYTES_PER_STATUS);
    assert_eq!(records[1].stream.output_bytes, 6 * BYTES_PER_STATUS);
    assert_eq!(records[1].stream.total_frames, 18);
    assert_eq!(records[1].stream.skipped_frames, 6);

    // Whatever was sampled after the last harvest is still in the collector
    let remainder = pipeline.stream.drain();
    let written: u64 = records.iter().map(|r| r.stream.output_bytes).sum();
    assert_eq!(
        written + remainder.output_bytes,
        pipeline.control.current_status().output_bytes
    );

    // Failed probes never stalled the other targets
    assert_eq!(pipeline.probe.pings(STREAM_HOST), 12);
    assert_eq!(pipeline.probe.pings("google.com"), 12);
    Ok(())
}

/// Records reach a CSV file with the failing target's cells blank
#[tokio::test(start_paused = true)]
async fn test_pipeline_writes_csv_rows() -> Result<()> {
    test_setup!();

    let temp_dir = TempDir::new()?;
    let csv_path = temp_dir.path().join("metrics.csv");
    let labels = vec!["obs".to_string(), "google".to_string()];

    let mut pipeline = pipeline(Duration::from_millis(100), Duration::from_millis(250));
    pipeline
        .harvester
        .add_sink(Box::new(CsvWriter::create(&csv_path, &labels)?));

    let mut handle = pipeline.harvester.start(pipeline.cancel.clone())?;
    tokio::time::sleep(Duration::from_millis(800)).await;

    // Cancelling the shared token stops samplers and harvester together
    pipeline.cancel.cancel();
    handle.stopped().await;
    pipeline.samplers.shutdown(Duration::from_secs(1)).await;
    let stats = handle.shutdown().await?;
    assert_eq!(stats.ticks, 3);

    let mut reader = csv::Reader::from_path(&csv_path)?;
    let headers = reader.headers()?.clone();
    assert_eq!(headers.get(0), Some("timestamp"));
    assert_eq!(headers.get(1), Some("obs_rtt_ms"));
    assert_eq!(headers.get(3), Some("google_rtt_ms"));

    let rows: Vec<csv::StringRecord> = reader.records().collect::<std::result::Result<_, _>>()?;
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.get(1), Some(""));
        assert_eq!(row.get(2), Some("no response received"));
        assert_eq!(row.get(3), Some("18.00"));
        assert_eq!(row.get(4), Some(""));
        assert_eq!(row.get(5), Some("true"));
        assert!(row.get(0).is_some_and(|ts| ts.ends_with('Z')));
    }
    Ok(())
}
