use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use obs_monitor::error::{SinkError, SinkResult};
use obs_monitor::output::MetricsSink;
use obs_monitor::record::ConsolidatedRecord;

/// Sink keeping every record it receives; clones share the same storage
#[derive(Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<ConsolidatedRecord>>>,
    closed: Arc<Mutex<bool>>,
    write_delay: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the writing thread for `delay` on every record
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: delay,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<ConsolidatedRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl MetricsSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn write(&mut self, record: &ConsolidatedRecord) -> SinkResult<()> {
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

/// Sink whose every write fails
#[derive(Clone, Default)]
pub struct FailingSink {
    attempts: Arc<AtomicU64>,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MetricsSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn write(&mut self, _record: &ConsolidatedRecord) -> SinkResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Closed {
            name: "failing".to_string(),
        })
    }
}
