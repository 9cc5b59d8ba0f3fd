//! Output sinks for consolidated records
//!
//! A sink receives every [`ConsolidatedRecord`] the harvester produces, in
//! order. Sink failures are reported back to the harvester, which logs them
//! and carries on; a failing sink never stops the others.

use std::fmt::Display;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use console::style;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{SinkError, SinkResult};
use crate::record::ConsolidatedRecord;

/// Destination for consolidated records
pub trait MetricsSink: Send {
    fn name(&self) -> &str;

    fn write(&mut self, record: &ConsolidatedRecord) -> SinkResult<()>;

    /// Flush and release resources; called once at harvester shutdown
    fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}

const TIMESTAMP_WIDTH: usize = 25;
const RTT_MIN_WIDTH: usize = 10;

struct Column {
    name: String,
    width: usize,
}

impl Column {
    fn new(name: impl Into<String>, min_width: usize) -> Self {
        let name = name.into();
        let width = name.len().max(min_width);
        Self { name, width }
    }
}

fn table_columns(target_labels: &[String]) -> Vec<Column> {
    let mut columns = vec![Column::new("timestamp", TIMESTAMP_WIDTH)];
    columns.extend(
        target_labels
            .iter()
            .map(|label| Column::new(format!("{label}_rtt_ms"), RTT_MIN_WIDTH)),
    );
    columns.extend([
        Column::new("stream_active", 0),
        Column::new("output_bytes", 12),
        Column::new("output_skipped_frames", 0),
        Column::new("output_frames", 0),
        Column::new("obs_cpu_%", 0),
        Column::new("obs_mem_mb", 0),
        Column::new("sys_cpu_%", 0),
        Column::new("sys_mem_%", 0),
    ]);
    columns
}

/// Human-readable, pipe-aligned table
pub struct ConsoleWriter<W: Write + Send = io::Stdout> {
    out: W,
    colored: bool,
    columns: Option<Vec<Column>>,
}

impl ConsoleWriter<io::Stdout> {
    /// Table on stdout, coloured when the terminal supports it
    pub fn stdout(colored: bool) -> Self {
        Self::with_writer(io::stdout(), colored && console::colors_enabled())
    }
}

impl<W: Write + Send> ConsoleWriter<W> {
    pub fn with_writer(out: W, colored: bool) -> Self {
        Self {
            out,
            colored,
            columns: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_header(out: &mut W, columns: &[Column]) -> io::Result<()> {
        let names: Vec<String> = columns
            .iter()
            .map(|c| format!("{:<width$}", c.name, width = c.width))
            .collect();
        writeln!(out, "{} | errors", names.join(" | "))?;

        let rules: Vec<String> = columns.iter().map(|c| "-".repeat(c.width)).collect();
        writeln!(out, "{}-|--------", rules.join("-|-"))
    }

    fn cells(record: &ConsolidatedRecord, labels: usize) -> Vec<String> {
        let mut cells = Vec::with_capacity(labels + 9);
        cells.push(record.timestamp_rfc3339());
        for target in &record.targets {
            cells.push(
                target
                    .rtt_ms()
                    .map(|ms| format!("{ms:.2}"))
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
        // Targets absent from this record still occupy their column
        while cells.len() < labels + 1 {
            cells.push("-".to_string());
        }
        cells.push(record.stream.active.to_string());
        cells.push(record.stream.output_bytes.to_string());
        cells.push(record.stream.skipped_frames.to_string());
        cells.push(record.stream.total_frames.to_string());
        cells.push(format!("{:.1}", record.stream_process.cpu_percent));
        cells.push(format!("{:.0}", record.stream_process.memory));
        cells.push(format!("{:.1}", record.system.cpu_percent));
        cells.push(format!("{:.1}", record.system.memory));
        cells
    }

    fn error_summary(&self, record: &ConsolidatedRecord) -> String {
        let summary = record
            .errors()
            .into_iter()
            .map(|(source, e)| format!("{source}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        if self.colored && !summary.is_empty() {
            style(summary).red().to_string()
        } else {
            summary
        }
    }
}

fn aligned(value: impl Display, width: usize) -> String {
    format!("{:>width$}", value, width = width)
}

impl<W: Write + Send> MetricsSink for ConsoleWriter<W> {
    fn name(&self) -> &str {
        "console"
    }

    fn write(&mut self, record: &ConsolidatedRecord) -> SinkResult<()> {
        if self.columns.is_none() {
            let columns = table_columns(&record.target_labels());
            Self::write_header(&mut self.out, &columns)?;
            self.columns = Some(columns);
        }
        let errors = self.error_summary(record);
        let Some(columns) = self.columns.as_ref() else {
            return Ok(());
        };

        let row: Vec<String> = Self::cells(record, columns.len() - 9)
            .into_iter()
            .zip(columns.iter())
            .map(|(cell, column)| aligned(cell, column.width))
            .collect();
        writeln!(self.out, "{} | {}", row.join(" | "), errors)?;
        self.out.flush()?;
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// One CSV row per record, flushed immediately
pub struct CsvWriter {
    path: PathBuf,
    labels: Vec<String>,
    writer: csv::Writer<File>,
}

impl CsvWriter {
    /// Create (truncate) the file and write the header row
    pub fn create(path: impl AsRef<Path>, target_labels: &[String]) -> SinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| SinkError::Create {
            path: path.display().to_string(),
            source,
        })?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(Self::header(target_labels))?;
        writer.flush()?;
        debug!(path = %path.display(), "CSV output created");

        Ok(Self {
            path,
            labels: target_labels.to_vec(),
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(target_labels: &[String]) -> Vec<String> {
        let mut header = vec!["timestamp".to_string()];
        for label in target_labels {
            header.push(format!("{label}_rtt_ms"));
            header.push(format!("{label}_ping_error"));
        }
        header.extend(
            [
                "stream_active",
                "output_bytes",
                "output_skipped_frames",
                "output_frames",
                "stream_error",
                "obs_cpu_percent",
                "obs_memory_mb",
                "obs_stats_error",
                "system_cpu_percent",
                "system_memory_percent",
                "system_metrics_error",
            ]
            .map(String::from),
        );
        header
    }

    pub fn row(&self, record: &ConsolidatedRecord) -> Vec<String> {
        let error_text = |e: Option<&crate::error::SampleError>| {
            e.map(ToString::to_string).unwrap_or_default()
        };

        // Targets are matched by position; two hosts may share a label
        let mut row = vec![record.timestamp_rfc3339()];
        for (index, label) in self.labels.iter().enumerate() {
            match record.targets.get(index).filter(|t| &t.label == label) {
                Some(target) => {
                    row.push(target.rtt_ms().map(|ms| format!("{ms:.2}")).unwrap_or_default());
                    row.push(error_text(target.error.as_ref()));
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }
        row.push(record.stream.active.to_string());
        row.push(record.stream.output_bytes.to_string());
        row.push(record.stream.skipped_frames.to_string());
        row.push(record.stream.total_frames.to_string());
        row.push(error_text(record.stream.error.as_ref()));
        row.push(format!("{:.2}", record.stream_process.cpu_percent));
        row.push(format!("{:.2}", record.stream_process.memory));
        row.push(error_text(record.stream_process.error.as_ref()));
        row.push(format!("{:.2}", record.system.cpu_percent));
        row.push(format!("{:.2}", record.system.memory));
        row.push(error_text(record.system.error.as_ref()));
        row
    }
}

impl MetricsSink for CsvWriter {
    fn name(&self) -> &str {
        "csv"
    }

    fn write(&mut self, record: &ConsolidatedRecord) -> SinkResult<()> {
        let row = self.row(record);
        self.writer.write_record(&row)?;
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> SinkResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Bounded queue in front of a slow sink.
///
/// Writes never block the harvester: when the queue is full the newest
/// record is dropped and counted. A dedicated worker thread drains the queue
/// into the wrapped sink; [`MetricsSink::close`] waits for it to finish.
pub struct BufferedSink {
    name: String,
    sender: Option<mpsc::Sender<ConsolidatedRecord>>,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl BufferedSink {
    /// Wrap `inner` and start its worker thread
    pub fn spawn(mut inner: Box<dyn MetricsSink>, capacity: usize) -> SinkResult<Self> {
        let name = format!("buffered {}", inner.name());
        let (sender, mut receiver) = mpsc::channel::<ConsolidatedRecord>(capacity.max(1));

        let worker = thread::Builder::new()
            .name(format!("sink-{}", inner.name()))
            .spawn(move || {
                while let Some(record) = receiver.blocking_recv() {
                    if let Err(e) = inner.write(&record) {
                        error!(sink = inner.name(), error = %e, "Failed to write buffered record");
                    }
                }
                if let Err(e) = inner.close() {
                    error!(sink = inner.name(), error = %e, "Failed to close sink");
                }
            })?;

        Ok(Self {
            name,
            sender: Some(sender),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: Some(worker),
        })
    }

    /// Records dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MetricsSink for BufferedSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, record: &ConsolidatedRecord) -> SinkResult<()> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(SinkError::Closed {
                name: self.name.clone(),
            });
        };
        match sender.try_send(record.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(sink = %self.name, dropped, "Sink queue full, dropping record");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed {
                name: self.name.clone(),
            }),
        }
    }

    /// Returns once every queued record is written and the wrapped sink
    /// is closed
    fn close(&mut self) -> SinkResult<()> {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(sink = %self.name, "Buffered sink worker panicked");
            }
        }
        let dropped = self.dropped();
        if dropped > 0 {
            warn!(sink = %self.name, dropped, "Records dropped while buffering");
        }
        Ok(())
    }
}
