use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Distributed-trace envelope carried on the `_trace` key of commands and
/// events. Absence never affects message processing; receivers reattach it
/// to correlated events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baggage: Option<String>,
}

tokio::task_local! {
    static CURRENT_TRACE: Option<TraceContext>;
}

/// Run `fut` with `trace` as the active trace context. Commands serialized
/// by the router inside the scope pick it up automatically.
pub async fn with_trace<F>(trace: Option<TraceContext>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_TRACE.scope(trace, fut).await
}

/// The active trace context, if any scope is installed on this task.
pub fn current_trace() -> Option<TraceContext> {
    CURRENT_TRACE.try_with(|t| t.clone()).ok().flatten()
}

/// A typed command the app sends to a runner through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: Uuid,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: CommandPayload,
    #[serde(rename = "_trace", skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl Command {
    pub fn new(project_id: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            timestamp: Utc::now(),
            payload,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<TraceContext>) -> Self {
        self.trace = trace;
        self
    }

    pub fn command_type(&self) -> &'static str {
        self.payload.command_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum CommandPayload {
    StartBuild {
        prompt: String,
        operation_type: String,
        project_slug: String,
        project_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        claude_model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        template: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_history: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_auto_fix: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_fix_error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        codex_thread_id: Option<String>,
    },
    StartDevServer {
        run_command: String,
        working_directory: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        preferred_port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        framework: Option<String>,
    },
    StopDevServer {},
    StartTunnel {
        port: u16,
    },
    StopTunnel {
        port: u16,
    },
    FetchLogs {
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    RunnerHealthCheck {},
    DeleteProjectFiles {
        slug: String,
    },
    ReadFile {
        slug: String,
        file_path: String,
    },
    WriteFile {
        slug: String,
        file_path: String,
        content: String,
    },
    ListFiles {
        slug: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    HttpProxyRequest {
        request_id: Uuid,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        port: u16,
    },
    HmrConnect {
        connection_id: String,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    HmrMessage {
        connection_id: String,
        message: String,
    },
    HmrDisconnect {
        connection_id: String,
    },
}

impl CommandPayload {
    pub fn command_type(&self) -> &'static str {
        match self {
            CommandPayload::StartBuild { .. } => "start-build",
            CommandPayload::StartDevServer { .. } => "start-dev-server",
            CommandPayload::StopDevServer {} => "stop-dev-server",
            CommandPayload::StartTunnel { .. } => "start-tunnel",
            CommandPayload::StopTunnel { .. } => "stop-tunnel",
            CommandPayload::FetchLogs { .. } => "fetch-logs",
            CommandPayload::RunnerHealthCheck {} => "runner-health-check",
            CommandPayload::DeleteProjectFiles { .. } => "delete-project-files",
            CommandPayload::ReadFile { .. } => "read-file",
            CommandPayload::WriteFile { .. } => "write-file",
            CommandPayload::ListFiles { .. } => "list-files",
            CommandPayload::HttpProxyRequest { .. } => "http-proxy-request",
            CommandPayload::HmrConnect { .. } => "hmr-connect",
            CommandPayload::HmrMessage { .. } => "hmr-message",
            CommandPayload::HmrDisconnect { .. } => "hmr-disconnect",
        }
    }
}

pub const KNOWN_COMMAND_TYPES: &[&str] = &[
    "start-build",
    "start-dev-server",
    "stop-dev-server",
    "start-tunnel",
    "stop-tunnel",
    "fetch-logs",
    "runner-health-check",
    "delete-project-files",
    "read-file",
    "write-file",
    "list-files",
    "http-proxy-request",
    "hmr-connect",
    "hmr-message",
    "hmr-disconnect",
];

/// A typed event a runner emits, optionally correlated to a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "_trace", skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            command_id: None,
            project_id: None,
            timestamp: Utc::now(),
            trace: None,
        }
    }

    pub fn with_command_id(mut self, command_id: Uuid) -> Self {
        self.command_id = Some(command_id);
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Proxy and HMR correlation events are routed to their managers only,
    /// never fanned out to browser subscribers.
    pub fn is_proxy_event(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::HttpProxyResponse { .. }
                | EventPayload::HttpProxyChunk { .. }
                | EventPayload::HttpProxyError { .. }
                | EventPayload::HmrConnected { .. }
                | EventPayload::HmrMessage { .. }
                | EventPayload::HmrDisconnected { .. }
                | EventPayload::HmrError { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    Ack,
    LogChunk {
        chunk: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream: Option<String>,
    },
    PortDetected {
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    PortConflict {
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        resolved_port: Option<u16>,
    },
    TunnelCreated {
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        tunnel_url: Option<String>,
    },
    TunnelClosed {
        port: u16,
    },
    ProcessExited {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    BuildProgress {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    BuildCompleted {
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    BuildFailed {
        error: String,
    },
    RunnerStatus {
        status: String,
    },
    BuildStream {
        data: Value,
    },
    ProjectMetadata {
        metadata: Value,
    },
    FilesDeleted {
        slug: String,
    },
    FileContent {
        file_path: String,
        content: String,
    },
    FileWritten {
        file_path: String,
    },
    FileList {
        files: Vec<FileListEntry>,
    },
    DevServerError {
        error: String,
    },
    AutofixStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    HttpProxyResponse {
        request_id: Uuid,
        status_code: u16,
        headers: HashMap<String, String>,
        is_chunked: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    HttpProxyChunk {
        request_id: Uuid,
        chunk: String,
        is_final: bool,
    },
    HttpProxyError {
        request_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        error: String,
    },
    HmrConnected {
        connection_id: String,
    },
    HmrMessage {
        connection_id: String,
        message: String,
    },
    HmrDisconnected {
        connection_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    HmrError {
        connection_id: String,
        error: String,
    },
    Error {
        error: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Ack => "ack",
            EventPayload::LogChunk { .. } => "log-chunk",
            EventPayload::PortDetected { .. } => "port-detected",
            EventPayload::PortConflict { .. } => "port-conflict",
            EventPayload::TunnelCreated { .. } => "tunnel-created",
            EventPayload::TunnelClosed { .. } => "tunnel-closed",
            EventPayload::ProcessExited { .. } => "process-exited",
            EventPayload::BuildProgress { .. } => "build-progress",
            EventPayload::BuildCompleted { .. } => "build-completed",
            EventPayload::BuildFailed { .. } => "build-failed",
            EventPayload::RunnerStatus { .. } => "runner-status",
            EventPayload::BuildStream { .. } => "build-stream",
            EventPayload::ProjectMetadata { .. } => "project-metadata",
            EventPayload::FilesDeleted { .. } => "files-deleted",
            EventPayload::FileContent { .. } => "file-content",
            EventPayload::FileWritten { .. } => "file-written",
            EventPayload::FileList { .. } => "file-list",
            EventPayload::DevServerError { .. } => "dev-server-error",
            EventPayload::AutofixStarted { .. } => "autofix-started",
            EventPayload::HttpProxyResponse { .. } => "http-proxy-response",
            EventPayload::HttpProxyChunk { .. } => "http-proxy-chunk",
            EventPayload::HttpProxyError { .. } => "http-proxy-error",
            EventPayload::HmrConnected { .. } => "hmr-connected",
            EventPayload::HmrMessage { .. } => "hmr-message",
            EventPayload::HmrDisconnected { .. } => "hmr-disconnected",
            EventPayload::HmrError { .. } => "hmr-error",
            EventPayload::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileListEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "ack",
    "log-chunk",
    "port-detected",
    "port-conflict",
    "tunnel-created",
    "tunnel-closed",
    "process-exited",
    "build-progress",
    "build-completed",
    "build-failed",
    "runner-status",
    "build-stream",
    "project-metadata",
    "files-deleted",
    "file-content",
    "file-written",
    "file-list",
    "dev-server-error",
    "autofix-started",
    "http-proxy-response",
    "http-proxy-chunk",
    "http-proxy-error",
    "hmr-connected",
    "hmr-message",
    "hmr-disconnected",
    "hmr-error",
    "error",
];

/// Result of decoding an inbound runner frame. Unknown discriminators are
/// preserved rather than treated as parse failures so newer runners can talk
/// to older brokers.
#[derive(Debug)]
pub enum DecodedEvent {
    Event(Box<Event>),
    Unknown { message_type: String, raw: Value },
}

pub fn decode_event(text: &str) -> Result<DecodedEvent, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let message_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    if !KNOWN_EVENT_TYPES.contains(&message_type.as_str()) {
        return Ok(DecodedEvent::Unknown {
            message_type,
            raw: value,
        });
    }

    let event: Event = serde_json::from_value(value)?;
    Ok(DecodedEvent::Event(Box::new(event)))
}

/// Command-side counterpart of [`decode_event`], used on the runner end of
/// the socket.
#[derive(Debug)]
pub enum DecodedCommand {
    Command(Box<Command>),
    Unknown { message_type: String, raw: Value },
}

pub fn decode_command(text: &str) -> Result<DecodedCommand, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let message_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    if !KNOWN_COMMAND_TYPES.contains(&message_type.as_str()) {
        return Ok(DecodedCommand::Unknown {
            message_type,
            raw: value,
        });
    }

    let command: Command = serde_json::from_value(value)?;
    Ok(DecodedCommand::Command(Box::new(command)))
}

/// Binary payloads inside proxy messages cross the wire as base64 strings.
pub fn encode_body(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_body(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(encoded)
}
