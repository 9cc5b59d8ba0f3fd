//! obs-websocket v5 client
//!
//! A single WebSocket connection is shared by every collector. Outgoing
//! requests go through a writer task; a reader task matches responses to
//! pending requests by id and turns `ExitStarted` events and closed
//! connections into [`SessionEvent::SessionEnded`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{ControlResult, StreamControlError};
use crate::stream::{
    ProcessStats, SessionEvent, StreamControl, StreamSettings, StreamStatus, VersionInfo,
};

pub const RPC_VERSION: u32 = 1;

/// Event subscription mask for the `General` category
const SUBSCRIBE_GENERAL: u32 = 1;

/// Close code obs-websocket sends when the identify payload fails authentication
const AUTHENTICATION_FAILED: u16 = 4009;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

mod op {
    pub const HELLO: u8 = 0;
    pub const IDENTIFY: u8 = 1;
    pub const IDENTIFIED: u8 = 2;
    pub const EVENT: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const REQUEST_RESPONSE: u8 = 7;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    op: u8,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    #[serde(default)]
    obs_web_socket_version: String,
    rpc_version: u32,
    authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
struct AuthChallenge {
    challenge: String,
    salt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Identify {
    rpc_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    authentication: Option<String>,
    event_subscriptions: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestResponse {
    request_type: String,
    request_id: String,
    request_status: RequestStatus,
    #[serde(default)]
    response_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RequestStatus {
    result: bool,
    code: i64,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Event {
    event_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamStatusResponse {
    output_active: bool,
    #[serde(default)]
    output_bytes: f64,
    #[serde(default)]
    output_skipped_frames: f64,
    #[serde(default)]
    output_total_frames: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamServiceSettingsResponse {
    #[serde(default)]
    stream_service_settings: ServiceSettings,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSettings {
    #[serde(default)]
    server: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionResponse {
    obs_version: String,
    obs_web_socket_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    cpu_usage: f64,
    memory_usage: f64,
}

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn authentication_string(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    STANDARD.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<RequestResponse>>>>;

/// Connection settings for [`ObsClient::connect`]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

impl ConnectOptions {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

pub struct ObsClient {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingRequests,
    events: broadcast::Sender<SessionEvent>,
    request_timeout: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ObsClient {
    /// Open the WebSocket, authenticate if challenged, and identify
    pub async fn connect(options: &ConnectOptions) -> ControlResult<Self> {
        let url = options.url();
        debug!(%url, "connecting to obs-websocket");

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| StreamControlError::Connection {
                reason: format!("{url}: {e}"),
            })?;
        let (mut sink, mut stream) = socket.split();

        let handshake = async {
            let hello: Hello = expect_op(&mut stream, op::HELLO).await?;
            trace!(version = %hello.obs_web_socket_version, rpc = hello.rpc_version, "hello received");

            let authentication = match hello.authentication {
                Some(auth) => {
                    let password = options.password.as_deref().ok_or_else(|| {
                        StreamControlError::Authentication {
                            reason: "server requires a password".to_string(),
                        }
                    })?;
                    Some(authentication_string(password, &auth.salt, &auth.challenge))
                }
                None => None,
            };

            let identify = Identify {
                rpc_version: RPC_VERSION.min(hello.rpc_version.max(1)),
                authentication,
                event_subscriptions: SUBSCRIBE_GENERAL,
            };
            let payload = json!({ "op": op::IDENTIFY, "d": identify });
            sink.send(Message::Text(payload.to_string()))
                .await
                .map_err(|e| StreamControlError::Connection {
                    reason: e.to_string(),
                })?;

            let _: Value = expect_op(&mut stream, op::IDENTIFIED).await?;
            Ok::<_, StreamControlError>(())
        };

        tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| StreamControlError::Connection {
                reason: "handshake timed out".to_string(),
            })??;
        info!(%url, "Connected to obs-websocket");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(16);
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    message = outgoing_rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                warn!(error = %e, "obs-websocket write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&pending),
            events.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            outgoing,
            pending,
            events,
            request_timeout: options.request_timeout,
            cancel,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    /// Send one request and wait for its response data
    pub async fn request(&self, request_type: &str, data: Option<Value>) -> ControlResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_requests().insert(request_id.clone(), tx);

        let mut body = json!({ "requestType": request_type, "requestId": request_id });
        if let Some(data) = data {
            body["requestData"] = data;
        }
        let payload = json!({ "op": op::REQUEST, "d": body });

        if self.outgoing.send(Message::Text(payload.to_string())).is_err() {
            self.pending_requests().remove(&request_id);
            return Err(StreamControlError::Closed);
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(StreamControlError::Closed),
            Err(_) => {
                self.pending_requests().remove(&request_id);
                return Err(StreamControlError::Timeout {
                    request_type: request_type.to_string(),
                });
            }
        };

        if !response.request_status.result {
            return Err(StreamControlError::RequestFailed {
                request_type: response.request_type,
                code: response.request_status.code,
                comment: response.request_status.comment.unwrap_or_default(),
            });
        }
        Ok(response.response_data.unwrap_or(Value::Null))
    }

    async fn typed_request<T: serde::de::DeserializeOwned>(&self, request_type: &str) -> ControlResult<T> {
        let data = self.request(request_type, None).await?;
        serde_json::from_value(data).map_err(|e| StreamControlError::Protocol {
            reason: format!("invalid {request_type} response: {e}"),
        })
    }

    fn pending_requests(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<RequestResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StreamControl for ObsClient {
    async fn stream_status(&self) -> ControlResult<StreamStatus> {
        let status: StreamStatusResponse = self.typed_request("GetStreamStatus").await?;
        Ok(StreamStatus {
            active: status.output_active,
            output_bytes: status.output_bytes as u64,
            skipped_frames: status.output_skipped_frames as u64,
            total_frames: status.output_total_frames as u64,
        })
    }

    async fn stream_settings(&self) -> ControlResult<StreamSettings> {
        let settings: StreamServiceSettingsResponse =
            self.typed_request("GetStreamServiceSettings").await?;
        match settings.stream_service_settings.server {
            Some(server_url) if !server_url.trim().is_empty() => Ok(StreamSettings { server_url }),
            _ => Err(StreamControlError::MissingServer),
        }
    }

    async fn version(&self) -> ControlResult<VersionInfo> {
        let version: VersionResponse = self.typed_request("GetVersion").await?;
        Ok(VersionInfo {
            app_version: version.obs_version,
            protocol_version: version.obs_web_socket_version,
        })
    }

    async fn process_stats(&self) -> ControlResult<ProcessStats> {
        let stats: StatsResponse = self.typed_request("GetStats").await?;
        Ok(ProcessStats {
            cpu_percent: stats.cpu_usage,
            memory_mb: stats.memory_usage,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!("obs-websocket connection closed");
    }
}

impl Drop for ObsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn expect_op<S, T>(stream: &mut S, expected: u8) -> ControlResult<T>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    T: serde::de::DeserializeOwned,
{
    loop {
        let message = stream.next().await.ok_or(StreamControlError::Closed)?;
        match message {
            Ok(Message::Text(text)) => {
                let envelope: Envelope =
                    serde_json::from_str(&text).map_err(|e| StreamControlError::Protocol {
                        reason: e.to_string(),
                    })?;
                if envelope.op != expected {
                    return Err(StreamControlError::Protocol {
                        reason: format!("expected op {expected}, got op {}", envelope.op),
                    });
                }
                return serde_json::from_value(envelope.d).map_err(|e| {
                    StreamControlError::Protocol {
                        reason: e.to_string(),
                    }
                });
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((u16::from(CloseCode::Normal), String::new()));
                return Err(if code == AUTHENTICATION_FAILED {
                    StreamControlError::Authentication { reason }
                } else {
                    StreamControlError::Connection {
                        reason: format!("closed with code {code}: {reason}"),
                    }
                });
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(StreamControlError::Connection {
                    reason: e.to_string(),
                })
            }
        }
    }
}

async fn read_loop<S>(
    mut stream: S,
    pending: PendingRequests,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let reason = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                if let Some(ended) = dispatch(&text, &pending) {
                    let _ = events.send(ended);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| format!("connection closed: {}", f.reason))
                    .unwrap_or_else(|| "connection closed".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("connection error: {e}"),
            None => break "connection closed".to_string(),
        }
    };

    // Dropping the senders fails every request still waiting
    pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    warn!(%reason, "obs-websocket session ended");
    let _ = events.send(SessionEvent::SessionEnded { reason });
}

/// Route one text frame; returns an event for the session watchers, if any
fn dispatch(text: &str, pending: &PendingRequests) -> Option<SessionEvent> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "ignoring malformed obs-websocket message");
            return None;
        }
    };

    match envelope.op {
        op::REQUEST_RESPONSE => {
            match serde_json::from_value::<RequestResponse>(envelope.d) {
                Ok(response) => {
                    let waiter = pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&response.request_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(response);
                        }
                        None => trace!(id = %response.request_id, "response for unknown request"),
                    }
                }
                Err(e) => warn!(error = %e, "malformed request response"),
            }
            None
        }
        op::EVENT => match serde_json::from_value::<Event>(envelope.d) {
            Ok(event) if event.event_type == "ExitStarted" => Some(SessionEvent::SessionEnded {
                reason: "OBS is exiting".to_string(),
            }),
            Ok(event) => {
                trace!(event = %event.event_type, "event ignored");
                None
            }
            Err(_) => None,
        },
        other => {
            trace!(op = other, "unhandled op code");
            None
        }
    }
}
