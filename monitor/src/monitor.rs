//! Monitor supervisor
//!
//! Wires the stream-control connection, the probes and the system stats
//! reader into collectors, starts one sampling loop per collector and the
//! harvester, and tears everything down again when the session ends or a
//! shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{MonitorConfig, PingConfig};
use crate::error::{MonitorError, Result};
use crate::harvester::{HarvestStats, Harvester, HarvesterHandle, HarvesterState};
use crate::output::{BufferedSink, ConsoleWriter, CsvWriter, MetricsSink};
use crate::pinger::{extract_host, IcmpProbe, PingTarget, RttCollector};
use crate::sampler::SamplerGroup;
use crate::stream::{ProcessStatsSource, SessionEvent, StreamCollector, StreamControl, VersionInfo};
use crate::system_stats::{SystemStats, SystemUsageSource, UsageCollector, UsageScope};

/// How long each sampling loop gets to finish after cancellation
const SAMPLER_GRACE: Duration = Duration::from_secs(2);

/// Label of the stream server's ping target
pub const STREAM_SERVER_LABEL: &str = "obs";

/// External dependencies of a monitor
#[derive(Clone)]
pub struct Collaborators {
    pub control: Arc<dyn StreamControl>,
    pub probe: Arc<dyn IcmpProbe>,
    pub system: Arc<dyn SystemStats>,
}

/// What the monitor learned while starting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub version: VersionInfo,
    pub stream_host: String,
    pub targets: Vec<PingTarget>,
    pub outputs: Vec<String>,
}

/// Monitor status
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorStatus {
    Created,
    Running,
    Stopping,
    Stopped,
    Error(String),
}

/// The stream server first, then every reference host
pub fn ping_targets(stream_host: &str, ping: &PingConfig) -> Vec<PingTarget> {
    let mut targets = vec![PingTarget::new(STREAM_SERVER_LABEL, stream_host)];
    targets.extend(ping.reference_hosts.iter().map(PingTarget::reference));
    targets
}

pub struct Monitor {
    config: MonitorConfig,
    collaborators: Collaborators,
    extra_sinks: Vec<Box<dyn MetricsSink>>,
    status: MonitorStatus,
    cancel: CancellationToken,
    samplers: Option<SamplerGroup>,
    harvester: Option<HarvesterHandle>,
    session_watch: Option<JoinHandle<()>>,
    session: Option<SessionInfo>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            extra_sinks: Vec::new(),
            status: MonitorStatus::Created,
            cancel: CancellationToken::new(),
            samplers: None,
            harvester: None,
            session_watch: None,
            session: None,
        }
    }

    /// Add a sink on top of the configured console and CSV outputs
    pub fn add_sink(&mut self, sink: Box<dyn MetricsSink>) {
        self.extra_sinks.push(sink);
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.clone()
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn harvester_state(&self) -> HarvesterState {
        match &self.harvester {
            Some(handle) => handle.state(),
            None if self.status == MonitorStatus::Created => HarvesterState::Idle,
            None => HarvesterState::Stopped,
        }
    }

    /// Cancelling this token stops the monitor as if the session had ended
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve the ping targets, start every collector and the harvester
    pub async fn start(&mut self) -> Result<SessionInfo> {
        if self.status != MonitorStatus::Created {
            return Err(MonitorError::Lifecycle(format!(
                "cannot start monitor in state {:?}",
                self.status
            )));
        }

        match self.try_start().await {
            Ok(session) => {
                self.status = MonitorStatus::Running;
                Ok(session)
            }
            Err(e) => {
                self.status = MonitorStatus::Error(e.to_string());
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    async fn try_start(&mut self) -> Result<SessionInfo> {
        tracing::info!("Starting OBS monitor");
        self.config.validate()?;

        let control = Arc::clone(&self.collaborators.control);
        let version = control.version().await?;
        let settings = control.stream_settings().await?;
        let stream_host = extract_host(&settings.server_url)?;
        let targets = ping_targets(&stream_host, &self.config.ping);

        let interval = self.config.sampling.metric_interval();
        let mut harvester = Harvester::new(self.config.sampling.writer_interval());

        let rtt_collectors: Vec<Arc<RttCollector>> = targets
            .iter()
            .map(|target| Arc::new(RttCollector::new(target.clone(), interval)))
            .collect();
        let stream = Arc::new(StreamCollector::new(interval));
        let stream_process = Arc::new(UsageCollector::new(UsageScope::StreamProcess, interval));
        let system = Arc::new(UsageCollector::new(UsageScope::System, interval));

        for collector in &rtt_collectors {
            harvester.register(collector.clone());
        }
        harvester.register(stream.clone());
        harvester.register(stream_process.clone());
        harvester.register(system.clone());
        harvester.validate()?;

        let outputs = self.attach_sinks(&mut harvester, &targets)?;

        // Subscribe before anything runs so an early exit is not missed
        let events = control.subscribe();

        let mut samplers = SamplerGroup::new(self.cancel.child_token());
        for collector in &rtt_collectors {
            collector.spawn(
                &mut samplers,
                Arc::clone(&self.collaborators.probe),
                self.config.ping.timeout(),
            );
        }
        stream.spawn(&mut samplers, Arc::clone(&control));
        stream_process.spawn(
            &mut samplers,
            Arc::new(ProcessStatsSource::new(Arc::clone(&control))),
        );
        system.spawn(
            &mut samplers,
            Arc::new(SystemUsageSource::new(Arc::clone(&self.collaborators.system))),
        );

        self.harvester = Some(harvester.start(self.cancel.clone())?);
        self.session_watch = Some(tokio::spawn(watch_session(events, self.cancel.clone())));
        self.samplers = Some(samplers);

        let session = SessionInfo {
            version,
            stream_host,
            targets,
            outputs,
        };
        log_banner(&session);
        self.session = Some(session.clone());
        Ok(session)
    }

    fn attach_sinks(
        &mut self,
        harvester: &mut Harvester,
        targets: &[PingTarget],
    ) -> Result<Vec<String>> {
        let labels: Vec<String> = targets.iter().map(|t| t.label.clone()).collect();
        let capacity = self.config.output.buffer_capacity;
        let mut sinks: Vec<Box<dyn MetricsSink>> = Vec::new();
        let mut outputs = Vec::new();

        if self.config.output.console {
            sinks.push(Box::new(ConsoleWriter::stdout(self.config.output.colored)));
            outputs.push("console".to_string());
        }
        if let Some(path) = &self.config.output.csv_path {
            sinks.push(Box::new(CsvWriter::create(path, &labels)?));
            outputs.push(format!("csv:{}", path.display()));
        }
        for sink in self.extra_sinks.drain(..) {
            outputs.push(sink.name().to_string());
            sinks.push(sink);
        }

        for sink in sinks {
            if capacity > 0 {
                harvester.add_sink(Box::new(BufferedSink::spawn(sink, capacity)?));
            } else {
                harvester.add_sink(sink);
            }
        }
        Ok(outputs)
    }

    /// Resolve once the harvester has stopped, whatever the cause
    pub async fn wait(&mut self) {
        if let Some(handle) = self.harvester.as_mut() {
            handle.stopped().await;
        }
    }

    /// Stop the harvester, the sampling loops and the connection
    pub async fn shutdown(&mut self) -> Result<HarvestStats> {
        if matches!(self.status, MonitorStatus::Stopped | MonitorStatus::Stopping) {
            return Err(MonitorError::Lifecycle("monitor already stopped".to_string()));
        }
        tracing::info!("Stopping OBS monitor");
        self.status = MonitorStatus::Stopping;
        self.cancel.cancel();

        let stats = match self.harvester.take() {
            Some(mut handle) => handle.shutdown().await?,
            None => HarvestStats::default(),
        };
        if let Some(samplers) = self.samplers.take() {
            samplers.shutdown(SAMPLER_GRACE).await;
        }
        if let Some(watch) = self.session_watch.take() {
            let _ = watch.await;
        }
        self.collaborators.control.disconnect().await;

        self.status = MonitorStatus::Stopped;
        tracing::info!(
            ticks = stats.ticks,
            records_written = stats.records_written,
            sink_failures = stats.sink_failures,
            "OBS monitor stopped"
        );
        Ok(stats)
    }
}

async fn watch_session(
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Ok(SessionEvent::SessionEnded { reason }) => {
                    tracing::info!(%reason, "Monitored session ended, shutting down");
                    cancel.cancel();
                    return;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "session events lagged");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

fn log_banner(session: &SessionInfo) {
    tracing::info!(
        obs_version = %session.version.app_version,
        protocol_version = %session.version.protocol_version,
        monitor_version = env!("CARGO_PKG_VERSION"),
        "Connected to OBS Studio"
    );
    tracing::info!(stream_host = %session.stream_host, "Pinging stream server");
    for target in session.targets.iter().skip(1) {
        tracing::info!(label = %target.label, host = %target.host, "Pinging reference host");
    }
    tracing::info!(outputs = ?session.outputs, "Writing metrics");
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
