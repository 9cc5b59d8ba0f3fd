//! Round-trip time collection
//!
//! Each ping target gets an [`RttCollector`]: a rolling-max collector over
//! round-trip times whose sampling loop fires probes without waiting for the
//! previous one to answer. Probes go through the [`IcmpProbe`] seam; the
//! production implementation shells out to the platform `ping` binary so no
//! raw-socket privileges are needed.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::trace;

use crate::collector::RollingMaxCollector;
use crate::error::{ControlResult, SampleError, StreamControlError};
use crate::harvester::Harvest;
use crate::record::{RecordBuilder, TargetReading};
use crate::sampler::{ProbeMode, SampleSource, SamplerGroup};

/// Wait for a single echo reply
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Extra time the `ping` child gets beyond its own timeout before it is killed
const PROCESS_GRACE: Duration = Duration::from_millis(500);

type Pattern = Lazy<Result<Regex, regex::Error>>;

static REPLY_TIME: Pattern =
    Lazy::new(|| Regex::new(r"time[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*ms"));

static RECEIVED: Pattern = Lazy::new(|| {
    Regex::new(r"(?:(\d+)\s+(?:packets\s+)?received)|(?:Received\s*=\s*(\d+))")
});

fn pattern(lazy: &'static Pattern) -> Result<&'static Regex, SampleError> {
    lazy.as_ref().map_err(|e| SampleError::Probe {
        reason: format!("ping output pattern: {e}"),
    })
}

/// Sends one echo request and reports the round-trip time
#[async_trait]
pub trait IcmpProbe: Send + Sync {
    async fn ping(&self, host: &str, timeout: Duration) -> Result<Duration, SampleError>;
}

/// Probe backed by the operating system's `ping` command
#[derive(Debug, Clone)]
pub struct SystemPing {
    program: String,
}

impl SystemPing {
    pub fn new() -> Self {
        Self {
            program: "ping".to_string(),
        }
    }

    /// Use a different `ping` binary
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SystemPing {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments for a single-packet ping on the current platform
pub fn ping_args(host: &str, timeout: Duration) -> Vec<String> {
    let wait_secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
    let mut args: Vec<String> = if cfg!(target_os = "windows") {
        vec![
            "-n".into(),
            "1".into(),
            "-w".into(),
            timeout.as_millis().max(1).to_string(),
        ]
    } else if cfg!(target_os = "macos") {
        vec!["-c".into(), "1".into(), "-t".into(), wait_secs.to_string()]
    } else {
        vec!["-c".into(), "1".into(), "-W".into(), wait_secs.to_string()]
    };
    args.push(host.to_string());
    args
}

/// Extract the round-trip time from `ping` output
pub fn parse_ping_output(output: &str) -> Result<Duration, SampleError> {
    let received = pattern(&RECEIVED)?.captures(output).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    });

    if received == Some(0) {
        return Err(SampleError::NoResponse);
    }

    match pattern(&REPLY_TIME)?.captures(output) {
        Some(caps) => {
            let millis: f64 = caps[1].parse().map_err(|_| SampleError::Probe {
                reason: format!("invalid reply time: {}", &caps[1]),
            })?;
            Ok(Duration::from_secs_f64(millis / 1000.0))
        }
        None if received.is_none() => Err(SampleError::Probe {
            reason: "unrecognized ping output".to_string(),
        }),
        None => Err(SampleError::Probe {
            reason: "reply without round-trip time".to_string(),
        }),
    }
}

#[async_trait]
impl IcmpProbe for SystemPing {
    async fn ping(&self, host: &str, timeout: Duration) -> Result<Duration, SampleError> {
        let mut command = Command::new(&self.program);
        command
            .args(ping_args(host, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let hard_limit = timeout + PROCESS_GRACE;
        let output = tokio::time::timeout(hard_limit, command.output())
            .await
            .map_err(|_| SampleError::Timeout {
                millis: hard_limit.as_millis() as u64,
            })?
            .map_err(|e| SampleError::Probe {
                reason: format!("failed to run {}: {}", self.program, e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!(host, status = ?output.status, "ping finished");

        match parse_ping_output(&stdout) {
            Err(SampleError::Probe { .. }) if !stderr.trim().is_empty() => Err(SampleError::Probe {
                reason: stderr.trim().to_string(),
            }),
            outcome => outcome,
        }
    }
}

/// Host part of a stream server URL.
///
/// URLs without a scheme are read as `rtmp://`. Credentials and port are
/// stripped; bracketed IPv6 literals lose their brackets.
pub fn extract_host(raw_url: &str) -> ControlResult<String> {
    let trimmed = raw_url.trim();
    if trimmed.is_empty() {
        return Err(StreamControlError::MissingServer);
    }

    let without_scheme = match trimmed.split_once("://") {
        Some((_, rest)) => rest,
        None => trimmed,
    };
    let authority = without_scheme
        .split(|c| matches!(c, '/' | '?' | '#'))
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();

    let host = if let Some(bracketed) = host_port.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or_default()
    } else {
        host_port.split(':').next().unwrap_or_default()
    };

    if host.is_empty() {
        return Err(StreamControlError::InvalidServerUrl {
            url: raw_url.to_string(),
        });
    }
    Ok(host.to_string())
}

/// Column label for a reference host: its first DNS label
pub fn target_label(host: &str) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.replace(['.', ':'], "_");
    }
    host.split('.')
        .next()
        .filter(|label| !label.is_empty())
        .unwrap_or(host)
        .to_lowercase()
}

/// A host the monitor pings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingTarget {
    pub label: String,
    pub host: String,
}

impl PingTarget {
    pub fn new(label: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            host: host.into(),
        }
    }

    /// Target labelled by the host's first DNS label
    pub fn reference(host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            label: target_label(&host),
            host,
        }
    }
}

/// Probes one host through an [`IcmpProbe`]
pub struct RttSource {
    host: String,
    timeout: Duration,
    probe: Arc<dyn IcmpProbe>,
}

#[async_trait]
impl SampleSource for RttSource {
    type Sample = Duration;

    async fn sample(&self) -> Result<Duration, SampleError> {
        self.probe.ping(&self.host, self.timeout).await
    }
}

/// Rolling maximum of round-trip times to one target
pub struct RttCollector {
    target: PingTarget,
    collector: Arc<RollingMaxCollector<Duration>>,
}

impl RttCollector {
    pub fn new(target: PingTarget, sampling_interval: Duration) -> Self {
        let collector = Arc::new(RollingMaxCollector::new(
            format!("ping {}", target.label),
            sampling_interval,
        ));
        Self { target, collector }
    }

    pub fn target(&self) -> &PingTarget {
        &self.target
    }

    pub fn collector(&self) -> &Arc<RollingMaxCollector<Duration>> {
        &self.collector
    }

    /// Start probing on the group's cadence; probes never wait for each other
    pub fn spawn(&self, group: &mut SamplerGroup, probe: Arc<dyn IcmpProbe>, timeout: Duration) {
        let source = Arc::new(RttSource {
            host: self.target.host.clone(),
            timeout,
            probe,
        });
        group.spawn(Arc::clone(&self.collector), source, ProbeMode::Detached);
    }

    pub fn drain(&self) -> TargetReading {
        let drained = self.collector.drain();
        TargetReading {
            label: self.target.label.clone(),
            host: self.target.host.clone(),
            rtt: Some(drained.reading.max).filter(|rtt| !rtt.is_zero()),
            error: drained.error,
        }
    }
}

impl Harvest for RttCollector {
    fn name(&self) -> &str {
        self.collector.name()
    }

    fn sampling_interval(&self) -> Duration {
        self.collector.sampling_interval()
    }

    fn harvest_into(&self, record: &mut RecordBuilder) {
        record.target(self.drain());
    }
}
