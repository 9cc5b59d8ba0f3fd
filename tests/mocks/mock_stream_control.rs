use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use obs_monitor::error::{ControlResult, StreamControlError};
use obs_monitor::stream::{
    ProcessStats, SessionEvent, StreamControl, StreamSettings, StreamStatus, VersionInfo,
};

/// Scripted stand-in for an obs-websocket connection.
///
/// Every `stream_status` call advances the output counters by the configured
/// step, so a sampling loop sees a steadily streaming session.
pub struct MockStreamControl {
    state: Mutex<MockState>,
    events: broadcast::Sender<SessionEvent>,
    disconnected: AtomicBool,
}

struct MockState {
    status: StreamStatus,
    step: StreamStatus,
    server_url: String,
    process: ProcessStats,
    status_error: Option<StreamControlError>,
    calls: HashMap<&'static str, u64>,
}

impl MockStreamControl {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            state: Mutex::new(MockState {
                status: StreamStatus {
                    active: true,
                    ..Default::default()
                },
                step: StreamStatus {
                    active: true,
                    output_bytes: 125_000,
                    skipped_frames: 0,
                    total_frames: 3,
                },
                server_url: server_url.into(),
                process: ProcessStats {
                    cpu_percent: 12.5,
                    memory_mb: 512.0,
                },
                status_error: None,
                calls: HashMap::new(),
            }),
            events,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Counter increase applied on every status request
    pub fn set_step(&self, output_bytes: u64, skipped_frames: u64, total_frames: u64) {
        let mut state = self.state.lock().unwrap();
        state.step.output_bytes = output_bytes;
        state.step.skipped_frames = skipped_frames;
        state.step.total_frames = total_frames;
    }

    pub fn set_process_stats(&self, cpu_percent: f64, memory_mb: f64) {
        self.state.lock().unwrap().process = ProcessStats {
            cpu_percent,
            memory_mb,
        };
    }

    /// Make status requests fail until cleared
    pub fn fail_status(&self, error: Option<StreamControlError>) {
        self.state.lock().unwrap().status_error = error;
    }

    /// Push the same notification OBS sends when it exits
    pub fn end_session(&self, reason: &str) {
        let _ = self.events.send(SessionEvent::SessionEnded {
            reason: reason.to_string(),
        });
    }

    pub fn calls(&self, request: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(request)
            .copied()
            .unwrap_or(0)
    }

    pub fn current_status(&self) -> StreamStatus {
        self.state.lock().unwrap().status
    }

    pub fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn count(state: &mut MockState, request: &'static str) {
        *state.calls.entry(request).or_insert(0) += 1;
    }
}

#[async_trait]
impl StreamControl for MockStreamControl {
    async fn stream_status(&self) -> ControlResult<StreamStatus> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "GetStreamStatus");
        if let Some(error) = state.status_error.clone() {
            return Err(error);
        }
        let step = state.step;
        state.status.output_bytes += step.output_bytes;
        state.status.skipped_frames += step.skipped_frames;
        state.status.total_frames += step.total_frames;
        Ok(state.status)
    }

    async fn stream_settings(&self) -> ControlResult<StreamSettings> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "GetStreamServiceSettings");
        Ok(StreamSettings {
            server_url: state.server_url.clone(),
        })
    }

    async fn version(&self) -> ControlResult<VersionInfo> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "GetVersion");
        Ok(VersionInfo {
            app_version: "30.1.2".to_string(),
            protocol_version: "5.4.2".to_string(),
        })
    }

    async fn process_stats(&self) -> ControlResult<ProcessStats> {
        let mut state = self.state.lock().unwrap();
        Self::count(&mut state, "GetStats");
        Ok(state.process)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}
