use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use obs_monitor::collector::{DeltaCounterCollector, RollingMaxCollector};
use obs_monitor::error::SampleError;
use obs_monitor::sampler::{ProbeMode, SampleSource, SamplerGroup};

use crate::test_setup;

/// Counter starting at zero that grows by a varying step on every read
struct RampingCounter {
    value: AtomicU64,
    reads: AtomicU64,
}

impl RampingCounter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    fn last(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SampleSource for RampingCounter {
    type Sample = u64;

    async fn sample(&self) -> Result<u64, SampleError> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        if read == 0 {
            return Ok(0);
        }
        let step = (read * 7919) % 1000 + 1;
        Ok(self.value.fetch_add(step, Ordering::SeqCst) + step)
    }
}

/// Gauge whose largest value is known up front
struct SawtoothGauge {
    reads: AtomicU64,
}

#[async_trait]
impl SampleSource for SawtoothGauge {
    type Sample = f64;

    async fn sample(&self) -> Result<f64, SampleError> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        Ok((read % 50) as f64)
    }
}

/// Deltas drained while sampling is running add up to the counter's final value
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_drains_conserve_counter() -> Result<()> {
    test_setup!();

    let collector = Arc::new(DeltaCounterCollector::<u64>::new(
        "bytes",
        Duration::from_millis(1),
    ));
    let source = Arc::new(RampingCounter::new());
    let cancel = CancellationToken::new();
    let mut samplers = SamplerGroup::new(cancel.child_token());
    samplers.spawn(collector.clone(), source.clone(), ProbeMode::Inline);

    let drainer = {
        let collector = collector.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut total = 0u64;
            let mut drains = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(3)) => {
                        total += collector.drain().reading.delta;
                        drains += 1;
                    }
                }
            }
            (total, drains)
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    samplers.shutdown(Duration::from_secs(1)).await;
    cancel.cancel();
    let (mut total, drains) = drainer.await?;
    total += collector.drain().reading.delta;

    assert!(drains > 10, "drainer ran {drains} times");
    assert!(source.last() > 0);
    assert_eq!(total, source.last());
    Ok(())
}

/// No sample is lost or counted twice by a drain racing the sampler
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_drains_keep_every_sample() -> Result<()> {
    test_setup!();

    let collector = Arc::new(RollingMaxCollector::<f64>::new(
        "gauge",
        Duration::from_millis(1),
    ));
    let source = Arc::new(SawtoothGauge {
        reads: AtomicU64::new(0),
    });
    let cancel = CancellationToken::new();
    let mut samplers = SamplerGroup::new(cancel.child_token());
    samplers.spawn(collector.clone(), source.clone(), ProbeMode::Inline);

    let mut seen = 0u64;
    let mut peak = 0.0f64;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let drained = collector.drain();
        assert!(drained.reading.sample_count >= seen);
        assert!(drained.reading.max < 50.0);
        seen = drained.reading.sample_count;
        peak = peak.max(drained.reading.max);
    }
    samplers.shutdown(Duration::from_secs(1)).await;
    let last = collector.drain();
    peak = peak.max(last.reading.max);

    assert_eq!(last.reading.sample_count, source.reads.load(Ordering::SeqCst));
    assert!(last.reading.sample_count >= 50, "only {seen} samples");
    assert_eq!(peak, 49.0);
    Ok(())
}
