//! MCP (Model Context Protocol) client support.
//!
//! An agent reaches its tool servers through this module: the JSON-RPC
//! framing, three transports, a typed client, and the loader that turns a
//! server's advertised tools into [`ToolRegistry`] entries.
//!
//! # Transport Types
//! - **Stream**: newline-delimited JSON over any already-open duplex byte
//!   stream, such as the pipes of a server process the caller launched.
//! - **HTTP**: a single MCP endpoint answering with JSON or SSE bodies.
//! - **SSE**: the older two-endpoint scheme, a GET event stream plus POSTs
//!   to the endpoint it announces.
//!
//! # Example
//! ```rust,ignore
//! use toolloop::mcp::{McpClient, McpServer, McpTools, StreamTransport};
//!
//! let transport = StreamTransport::new(child_stdout, child_stdin);
//! let server = McpServer::new("files", McpClient::new(transport));
//! let added = McpTools::new().register_tools(Arc::new(server), &mut registry).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::error::{AgentError, Result};
use crate::llm::{SseDecoder, SseEvent};
use crate::tool::{Tool, ToolOutput, ToolRegistry};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const METHOD_NOT_FOUND: i32 = -32601;

// ─────────────────────────────────────────────────────────────────────────────
// MCP Protocol Types
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-RPC request or notification. Notifications carry no id.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn numeric_id(&self) -> Option<u64> {
        match &self.id {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse::<u64>().ok(),
            _ => None,
        }
    }

    fn answers(&self, id: u64) -> bool {
        self.numeric_id() == Some(id)
    }

    /// The `result` payload, or the server's error as [`AgentError::Mcp`].
    pub fn into_result(self, method: &str) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(AgentError::Mcp(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Tool definition advertised by a server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpToolDefinition>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        #[serde(default)]
        data: String,
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    #[serde(rename = "audio")]
    Audio {
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    #[serde(rename = "resource")]
    Resource { resource: Value },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Collapse the content items into the text handed back to the model.
    pub fn flatten(&self) -> ToolOutput {
        let parts: Vec<String> = self
            .content
            .iter()
            .map(|item| match item {
                ContentItem::Text { text } => text.clone(),
                ContentItem::Image { mime_type, .. } => {
                    format!("[image: {}]", mime_type.as_deref().unwrap_or("image/png"))
                }
                ContentItem::Audio { mime_type } => {
                    format!("[audio: {}]", mime_type.as_deref().unwrap_or("audio/wav"))
                }
                ContentItem::Resource { resource } => match resource.get("text").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => format!(
                        "[resource: {}]",
                        resource.get("uri").and_then(Value::as_str).unwrap_or("unknown")
                    ),
                },
                ContentItem::Unsupported => "[unsupported content]".to_string(),
            })
            .collect();
        ToolOutput {
            content: parts.join("\n"),
            is_error: self.is_error,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport Trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for its response. The transport assigns the id.
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a notification; no response is expected.
    async fn notify(&self, notification: JsonRpcRequest) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream Transport
// ─────────────────────────────────────────────────────────────────────────────

struct StreamHalves<R, W> {
    reader: BufReader<R>,
    writer: W,
}

/// Newline-delimited JSON-RPC over an open byte stream.
///
/// One exchange is in flight at a time; the halves stay locked from write
/// until the matching response has been read.
pub struct StreamTransport<R, W> {
    halves: Mutex<StreamHalves<R, W>>,
    request_id: AtomicU64,
    timeout: Duration,
    closed: AtomicBool,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            halves: Mutex::new(StreamHalves {
                reader: BufReader::new(reader),
                writer,
            }),
            request_id: AtomicU64::new(1),
            timeout: Duration::from_secs(60),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Mcp("transport is closed".into()));
        }
        Ok(())
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &impl Serialize) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| AgentError::Mcp(format!("Failed to write to MCP server: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AgentError::Mcp(format!("Failed to flush: {e}")))?;
    Ok(())
}

/// Servers may ping us; anything else they ask for is unsupported.
fn reply_to_server_request(method: &str, request_id: &Value) -> Value {
    if method == "ping" {
        json!({"jsonrpc": "2.0", "id": request_id, "result": {}})
    } else {
        json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "error": {"code": METHOD_NOT_FOUND, "message": format!("method `{method}` not supported")},
        })
    }
}

async fn await_response<R, W>(halves: &mut StreamHalves<R, W>, id: u64) -> Result<JsonRpcResponse>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = halves
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| AgentError::Mcp(format!("Failed to read from MCP server: {e}")))?;
        if read == 0 {
            return Err(AgentError::Mcp("MCP server closed the stream".into()));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let incoming: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(line = %trimmed, error = %err, "skipping non JSON-RPC output");
                continue;
            }
        };

        if let Some(method) = incoming.get("method").and_then(Value::as_str) {
            match incoming.get("id") {
                Some(request_id) => {
                    tracing::debug!(%method, "answering server request");
                    let reply = reply_to_server_request(method, request_id);
                    write_line(&mut halves.writer, &reply).await?;
                }
                None => tracing::debug!(%method, "ignoring server notification"),
            }
            continue;
        }

        let response: JsonRpcResponse = match serde_json::from_value(incoming) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(line = %trimmed, error = %err, "skipping non JSON-RPC output");
                continue;
            }
        };
        if response.answers(id) {
            return Ok(response);
        }
        tracing::debug!(expected = id, got = ?response.id, "discarding response with stale id");
    }
}

#[async_trait]
impl<R, W> McpTransport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.ensure_open()?;
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        request.id = Some(id);

        let mut halves = self.halves.lock().await;
        tracing::debug!(id, method = %request.method, "sending MCP request");
        write_line(&mut halves.writer, &request).await?;
        tokio::time::timeout(self.timeout, await_response(&mut halves, id))
            .await
            .map_err(|_| {
                AgentError::Mcp(format!(
                    "`{}` timed out after {:?}",
                    request.method, self.timeout
                ))
            })?
    }

    async fn notify(&self, mut notification: JsonRpcRequest) -> Result<()> {
        self.ensure_open()?;
        notification.id = None;
        let mut halves = self.halves.lock().await;
        write_line(&mut halves.writer, &notification).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut halves = self.halves.lock().await;
        halves
            .writer
            .shutdown()
            .await
            .map_err(|e| AgentError::Mcp(format!("Failed to close MCP stream: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Transport
// ─────────────────────────────────────────────────────────────────────────────

const SESSION_HEADER: &str = "mcp-session-id";

fn header_map(headers: &BTreeMap<String, String>) -> Result<reqwest::header::HeaderMap> {
    let mut map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::try_from(key.as_str())
            .map_err(|e| AgentError::Config(format!("invalid header name `{key}`: {e}")))?;
        let value = reqwest::header::HeaderValue::try_from(value.as_str())
            .map_err(|e| AgentError::Config(format!("invalid value for header `{key}`: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Transport that talks to an MCP server over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
    session_id: std::sync::Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_headers(url, BTreeMap::new(), Duration::from_secs(60))
    }

    /// Create with static headers (e.g., for authentication).
    pub fn with_headers(
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(header_map(&headers)?)
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Mcp(format!("http client error: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            request_id: AtomicU64::new(1),
            session_id: std::sync::Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Mcp(format!("HTTP request failed: {e}")))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session.to_string());
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Mcp(format!(
                "`{}` returned {status}: {body}",
                self.url
            )));
        }
        Ok(response)
    }
}

fn response_from_sse(body: &str, id: u64) -> Result<JsonRpcResponse> {
    let mut decoder = SseDecoder::default();
    let mut events = decoder.push(body.as_bytes());
    events.extend(decoder.finish());
    for data in events {
        let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&data) else {
            continue;
        };
        if response.answers(id) {
            return Ok(response);
        }
    }
    Err(AgentError::Mcp(format!(
        "event stream ended without a response to request {id}"
    )))
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        request.id = Some(id);
        tracing::debug!(id, method = %request.method, url = %self.url, "sending MCP request");

        let response = self.post(&request).await?;
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("text/event-stream"))
            .unwrap_or(false);
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::Mcp(format!("Failed to read response: {e}")))?;

        if is_sse {
            response_from_sse(&body, id)
        } else {
            serde_json::from_str(&body)
                .map_err(|e| AgentError::Mcp(format!("Failed to parse response: {e}")))
        }
    }

    async fn notify(&self, mut notification: JsonRpcRequest) -> Result<()> {
        notification.id = None;
        self.post(&notification).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let Some(session) = self.session_id() else {
            return Ok(());
        };
        // servers may refuse session termination; that is not an error for us
        if let Err(err) = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session)
            .send()
            .await
        {
            tracing::debug!(error = %err, "session termination request failed");
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Legacy SSE Transport
// ─────────────────────────────────────────────────────────────────────────────

type PendingResponses = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

fn lock_pending(
    pending: &PendingResponses,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The HTTP+SSE transport used by older servers (Gradio's `/gradio_api/mcp/sse`).
///
/// A long-lived GET stream first announces an `endpoint` event, then carries
/// every response. Requests are POSTed to that endpoint. The stream is opened
/// on first use.
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
    timeout: Duration,
    session: OnceCell<SseSession>,
    pending: PendingResponses,
    closed: AtomicBool,
}

struct SseSession {
    endpoint: String,
    reader: JoinHandle<()>,
}

impl SseTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_headers(url, BTreeMap::new(), Duration::from_secs(60))
    }

    /// `timeout` bounds connecting and each request, never the event stream itself.
    pub fn with_headers(
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(header_map(&headers)?)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AgentError::Mcp(format!("http client error: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            request_id: AtomicU64::new(1),
            timeout,
            session: OnceCell::new(),
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Where requests are posted, once the stream has announced it.
    pub fn endpoint(&self) -> Option<&str> {
        self.session.get().map(|session| session.endpoint.as_str())
    }

    async fn session(&self) -> Result<&SseSession> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Mcp("transport is closed".into()));
        }
        self.session.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> Result<SseSession> {
        let base = reqwest::Url::parse(&self.url)
            .map_err(|e| AgentError::Config(format!("invalid MCP url `{}`: {e}", self.url)))?;
        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .get(&self.url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| AgentError::Mcp(format!("connecting to `{}` timed out", self.url)))?
        .map_err(|e| AgentError::Mcp(format!("HTTP request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Mcp(format!(
                "`{}` returned {status}: {body}",
                self.url
            )));
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = SseDecoder::default();
        let mut backlog = Vec::new();
        let announced = tokio::time::timeout(self.timeout, async {
            loop {
                let Some(chunk) = body.next().await else {
                    return Err(AgentError::Mcp(
                        "event stream closed before announcing an endpoint".into(),
                    ));
                };
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => return Err(AgentError::Mcp(format!("stream error: {err}"))),
                };
                let mut events = decoder.push_events(&chunk).into_iter();
                while let Some(event) = events.next() {
                    if event.event.as_deref() == Some("endpoint") {
                        backlog.extend(events);
                        return Ok(event.data);
                    }
                }
            }
        })
        .await
        .map_err(|_| AgentError::Mcp(format!("`{}` never announced an endpoint", self.url)))??;

        let endpoint = base
            .join(announced.trim())
            .map_err(|e| AgentError::Mcp(format!("invalid endpoint `{announced}`: {e}")))?
            .to_string();
        tracing::info!(url = %self.url, %endpoint, "MCP event stream connected");

        let reader = tokio::spawn(pump_events(
            body,
            decoder,
            backlog,
            Arc::clone(&self.pending),
            self.client.clone(),
            endpoint.clone(),
        ));
        Ok(SseSession { endpoint, reader })
    }

    async fn post(&self, endpoint: &str, body: &JsonRpcRequest) -> Result<()> {
        let response = tokio::time::timeout(self.timeout, self.client.post(endpoint).json(body).send())
            .await
            .map_err(|_| AgentError::Mcp(format!("`{}` timed out after {:?}", body.method, self.timeout)))?
            .map_err(|e| AgentError::Mcp(format!("HTTP request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Mcp(format!("`{endpoint}` returned {status}: {body}")));
        }
        Ok(())
    }
}

/// Routes every event of the stream until it ends. Waiters left behind see
/// their channel close.
async fn pump_events<S, B>(
    mut body: S,
    mut decoder: SseDecoder,
    backlog: Vec<SseEvent>,
    pending: PendingResponses,
    client: reqwest::Client,
    endpoint: String,
) where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    for event in backlog {
        route_event(event, &pending, &client, &endpoint).await;
    }
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(error = %err, "MCP event stream failed");
                break;
            }
        };
        for event in decoder.push_events(chunk.as_ref()) {
            route_event(event, &pending, &client, &endpoint).await;
        }
    }
    tracing::debug!(%endpoint, "MCP event stream ended");
    lock_pending(&pending).clear();
}

async fn route_event(
    event: SseEvent,
    pending: &PendingResponses,
    client: &reqwest::Client,
    endpoint: &str,
) {
    if event.event.as_deref().is_some_and(|kind| kind != "message") {
        tracing::debug!(kind = ?event.event, "ignoring event");
        return;
    }
    let incoming: Value = match serde_json::from_str(&event.data) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(data = %event.data, error = %err, "skipping non JSON-RPC event");
            return;
        }
    };

    if let Some(method) = incoming.get("method").and_then(Value::as_str) {
        match incoming.get("id") {
            Some(request_id) => {
                tracing::debug!(%method, "answering server request");
                let reply = reply_to_server_request(method, request_id);
                if let Err(err) = client.post(endpoint).json(&reply).send().await {
                    tracing::warn!(%method, error = %err, "failed to answer server request");
                }
            }
            None => tracing::debug!(%method, "ignoring server notification"),
        }
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(incoming) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(data = %event.data, error = %err, "skipping non JSON-RPC event");
            return;
        }
    };
    let waiter = response
        .numeric_id()
        .and_then(|id| lock_pending(pending).remove(&id));
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(response);
        }
        None => tracing::debug!(id = ?response.id, "discarding response nobody is waiting for"),
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let session = self.session().await?;
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        request.id = Some(id);
        tracing::debug!(id, method = %request.method, endpoint = %session.endpoint, "sending MCP request");

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        if let Err(err) = self.post(&session.endpoint, &request).await {
            lock_pending(&self.pending).remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(AgentError::Mcp(
                "MCP event stream closed before the response arrived".into(),
            )),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(AgentError::Mcp(format!(
                    "`{}` timed out after {:?}",
                    request.method, self.timeout
                )))
            }
        }
    }

    async fn notify(&self, mut notification: JsonRpcRequest) -> Result<()> {
        let session = self.session().await?;
        notification.id = None;
        self.post(&session.endpoint, &notification).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(session) = self.session.get() {
            session.reader.abort();
        }
        lock_pending(&self.pending).clear();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get() {
            session.reader.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP Client
// ─────────────────────────────────────────────────────────────────────────────

pub struct McpClient<T: McpTransport> {
    transport: T,
    initialized: bool,
    server_info: Option<ServerInfo>,
    capabilities: Option<ServerCapabilities>,
}

impl<T: McpTransport> McpClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            initialized: false,
            server_info: None,
            capabilities: None,
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.transport
            .send(JsonRpcRequest::new(method, params))
            .await?
            .into_result(method)
    }

    /// Perform the initialize handshake once; later calls return the cached info.
    pub async fn initialize(&mut self) -> Result<&ServerInfo> {
        if !self.initialized {
            let raw = self
                .request(
                    "initialize",
                    Some(json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {},
                        "clientInfo": {
                            "name": env!("CARGO_PKG_NAME"),
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    })),
                )
                .await?;
            let result: InitializeResult = serde_json::from_value(raw)
                .map_err(|e| AgentError::Mcp(format!("Failed to parse initialize result: {e}")))?;

            if result.protocol_version != PROTOCOL_VERSION {
                tracing::debug!(server = %result.protocol_version, client = PROTOCOL_VERSION, "protocol version negotiated down");
            }
            tracing::info!(server = %result.server_info.name, version = ?result.server_info.version, "MCP server initialized");

            self.server_info = Some(result.server_info);
            self.capabilities = Some(result.capabilities);

            self.transport
                .notify(JsonRpcRequest::new("notifications/initialized", None))
                .await?;
            self.initialized = true;
        }

        self.server_info
            .as_ref()
            .ok_or_else(|| AgentError::Mcp("Server info not available".into()))
    }

    /// List every tool the server advertises, following pagination cursors.
    pub async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>> {
        if !self.initialized {
            self.initialize().await?;
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let raw = self.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(raw)
                .map_err(|e| AgentError::Mcp(format!("Failed to parse list_tools result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<CallToolResult> {
        if !self.initialized {
            self.initialize().await?;
        }

        let raw = self
            .request(
                "tools/call",
                Some(json!({
                    "name": name,
                    "arguments": arguments
                })),
            )
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| AgentError::Mcp(format!("Failed to parse call_tool result: {e}")))
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.capabilities.as_ref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool servers
// ─────────────────────────────────────────────────────────────────────────────

/// Object-safe handle on a connected tool server.
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn label(&self) -> &str;
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult>;
    async fn close(&self) -> Result<()>;
}

pub struct McpServer<T: McpTransport> {
    label: String,
    client: Mutex<McpClient<T>>,
}

impl<T: McpTransport> McpServer<T> {
    pub fn new(label: impl Into<String>, client: McpClient<T>) -> Self {
        Self {
            label: label.into(),
            client: Mutex::new(client),
        }
    }
}

#[async_trait]
impl<T: McpTransport> ToolServer for McpServer<T> {
    fn label(&self) -> &str {
        &self.label
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>> {
        self.client.lock().await.list_tools().await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.client.lock().await.call_tool(name, arguments).await
    }

    async fn close(&self) -> Result<()> {
        self.client.lock().await.close().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP Tools Integration
// ─────────────────────────────────────────────────────────────────────────────

/// Loads a server's advertised tools into a [`ToolRegistry`].
#[derive(Debug, Clone, Default)]
pub struct McpTools {
    tool_prefix: Option<String>,
}

impl McpTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose every tool as `{prefix}_{name}`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tool_prefix = Some(prefix.into());
        self
    }

    /// Returns how many tools were added; names already taken are skipped.
    pub async fn register_tools(
        &self,
        server: Arc<dyn ToolServer>,
        registry: &mut ToolRegistry,
    ) -> Result<usize> {
        let tools = server.list_tools().await?;

        let mut count = 0;
        for tool_def in tools {
            let name = match &self.tool_prefix {
                Some(prefix) => format!("{}_{}", prefix, tool_def.name),
                None => tool_def.name.clone(),
            };
            let description = tool_def
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| format!("MCP tool: {}", tool_def.name));

            let wrapper = McpToolWrapper {
                name,
                description,
                parameters: tool_def.input_schema,
                server: Arc::clone(&server),
                mcp_tool_name: tool_def.name,
            };
            if registry.register(wrapper) {
                count += 1;
            }
        }

        tracing::info!(server = %server.label(), added = count, "loaded MCP tools");
        Ok(count)
    }
}

struct McpToolWrapper {
    name: String,
    description: String,
    parameters: Value,
    server: Arc<dyn ToolServer>,
    mcp_tool_name: String,
}

#[async_trait]
impl Tool for McpToolWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Option<Value> {
        Some(self.parameters.clone())
    }

    async fn call(&self, input: Value) -> Result<ToolOutput> {
        let result = self
            .server
            .call_tool(&self.mcp_tool_name, input)
            .await
            .map_err(|err| AgentError::ToolInvocation {
                name: self.name.clone(),
                source: Box::new(err),
            })?;
        Ok(result.flatten())
    }
}
