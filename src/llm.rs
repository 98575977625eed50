//! Language model abstraction and the streaming chat-completions client.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ModelConfig;
use crate::error::{AgentError, Result};
use crate::message::{Message, Role, ToolCall};
use crate::telemetry::RetryPolicy;
use crate::tool::ToolDescription;

/// Fragment of a tool call as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One streamed unit of model output: partial text, partial tool calls, or both.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

impl ChatDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

pub type ChatStream = BoxStream<'static, Result<ChatDelta>>;

/// Minimal abstraction around a streaming chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_chat(&self, messages: &[Message], tools: &[ToolDescription])
        -> Result<ChatStream>;
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds streamed deltas into the assistant message they describe.
#[derive(Debug, Default)]
pub struct CompletionAssembler {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
}

impl CompletionAssembler {
    pub fn push(&mut self, delta: &ChatDelta) {
        if let Some(text) = &delta.content {
            self.content.push_str(text);
        }
        for fragment in &delta.tool_calls {
            let call = self.calls.entry(fragment.index).or_default();
            if let Some(id) = &fragment.id {
                if !id.is_empty() {
                    call.id = Some(id.clone());
                }
            }
            if let Some(name) = &fragment.name {
                // some providers repeat the full name on every fragment
                if call.name != *name {
                    call.name.push_str(name);
                }
            }
            if let Some(args) = &fragment.arguments {
                call.arguments.push_str(args);
            }
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    pub fn finish(self) -> Message {
        let tool_calls = self
            .calls
            .into_values()
            .filter_map(|call| {
                if call.name.is_empty() {
                    tracing::warn!(arguments = %call.arguments, "dropping tool call without a name");
                    return None;
                }
                let id = call
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                Some(ToolCall::new(id, call.name, call.arguments))
            })
            .collect();
        let content = if self.content.is_empty() {
            None
        } else {
            Some(self.content)
        };
        Message::assistant_with_tool_calls(content, tool_calls)
    }
}

const ROUTER_BASE: &str = "https://router.huggingface.co";

const ROUTED_PROVIDERS: &[&str] = &[
    "cerebras",
    "cohere",
    "featherless-ai",
    "fireworks-ai",
    "groq",
    "hyperbolic",
    "nebius",
    "novita",
    "nscale",
    "sambanova",
    "together",
];

pub fn is_known_provider(provider: &str) -> bool {
    provider == "openai" || provider == "hf-inference" || ROUTED_PROVIDERS.contains(&provider)
}

/// Base URL (without `/chat/completions`) for a provider and model.
pub fn resolve_base_url(provider: &str, model: &str, base_url: Option<&str>) -> Result<String> {
    if let Some(url) = base_url {
        return Ok(url.trim_end_matches('/').to_string());
    }
    match provider {
        "openai" => Ok("https://api.openai.com/v1".to_string()),
        "hf-inference" => Ok(format!("{ROUTER_BASE}/hf-inference/models/{model}/v1")),
        other if ROUTED_PROVIDERS.contains(&other) => Ok(format!("{ROUTER_BASE}/{other}/v1")),
        other => Err(AgentError::Config(format!(
            "unknown provider `{other}` and no base_url configured"
        ))),
    }
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Yields the `data` payload of every complete event. Bytes are buffered
/// until a newline so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.push_events(bytes).into_iter().map(|e| e.data).collect()
    }

    /// Flush an event left open when the body ended without a blank line.
    pub fn finish(&mut self) -> Vec<String> {
        self.finish_events().into_iter().map(|e| e.data).collect()
    }

    /// Like [`SseDecoder::push`], keeping each event's type.
    pub fn push_events(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            self.process_line(line, &mut events);
        }
        events
    }

    pub fn finish_events(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            self.process_line(&line, &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event = self.event.take();
        if !self.data.is_empty() {
            events.push(SseEvent {
                event,
                data: self.data.drain(..).collect::<Vec<_>>().join("\n"),
            });
        }
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim().to_string());
        }
    }
}

enum StreamPayload {
    Done,
    Delta(ChatDelta),
    Skip,
}

fn parse_stream_payload(data: &str) -> Result<StreamPayload> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamPayload::Done);
    }
    if data.is_empty() {
        return Ok(StreamPayload::Skip);
    }
    let parsed: WireStreamChunk = serde_json::from_str(data).map_err(|err| {
        AgentError::LanguageModel(format!("stream parse error `{data}`: {err}"))
    })?;
    if let Some(error) = parsed.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(AgentError::LanguageModel(format!("provider error: {message}")));
    }
    let Some(choice) = parsed.choices.into_iter().next() else {
        return Ok(StreamPayload::Skip);
    };

    let tool_calls = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(position, call)| {
            let (name, arguments) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            ToolCallDelta {
                index: call.index.unwrap_or(position),
                id: call.id,
                name,
                arguments,
            }
        })
        .collect();

    Ok(StreamPayload::Delta(ChatDelta {
        content: choice.delta.content.filter(|text| !text.is_empty()),
        tool_calls,
        finish_reason: choice.finish_reason,
    }))
}

fn coalesce_error(status: reqwest::StatusCode, body: &str) -> AgentError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return AgentError::LanguageModel(format!("rate limit exceeded: {body}"));
    }
    AgentError::LanguageModel(format!("request failed with {status}: {body}"))
}

struct SendFailure {
    error: AgentError,
    transient: bool,
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

/// Streaming client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatCompletionClient {
    http: reqwest::Client,
    model: String,
    api_key: Option<String>,
    base_url: String,
    retry: RetryPolicy,
}

impl ChatCompletionClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: build_http(Duration::from_secs(60))?,
            model: model.into(),
            api_key: None,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default_external_call(),
        })
    }

    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let base_url = resolve_base_url(&cfg.provider, &cfg.model, cfg.base_url.as_deref())?;
        Ok(Self {
            http: build_http(Duration::from_secs(cfg.timeout_secs))?,
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            base_url,
            retry: RetryPolicy::default_external_call().with_max_retries(cfg.max_retries),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn payload(&self, messages: &[Message], tools: &[ToolDescription]) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": to_wire_messages(messages),
            "stream": true,
        });
        if !tools.is_empty() {
            payload["tools"] = json!(to_wire_tools(tools));
            payload["tool_choice"] = json!("auto");
        }
        payload
    }
}

fn build_http(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| AgentError::LanguageModel(format!("http client error: {err}")))
}

#[async_trait]
impl LanguageModel for ChatCompletionClient {
    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ChatStream> {
        let payload = self.payload(messages, tools);
        let url = self.endpoint();
        tracing::debug!(model = %self.model, %url, messages = messages.len(), tools = tools.len(), "requesting chat completion");

        let response = self
            .retry
            .retry(
                "chat_completions",
                |_| {
                    let mut request = self.http.post(&url).json(&payload);
                    if let Some(key) = &self.api_key {
                        request = request.bearer_auth(key);
                    }
                    async move {
                        match request.send().await {
                            Ok(resp) if resp.status().is_success() => Ok(resp),
                            Ok(resp) => {
                                let status = resp.status();
                                let body = resp.text().await.unwrap_or_default();
                                Err(SendFailure {
                                    error: coalesce_error(status, &body),
                                    transient: status == reqwest::StatusCode::TOO_MANY_REQUESTS
                                        || status.is_server_error(),
                                })
                            }
                            Err(err) => Err(SendFailure {
                                error: AgentError::LanguageModel(format!("request error: {err}")),
                                transient: err.is_connect() || err.is_timeout(),
                            }),
                        }
                    }
                },
                |failure| failure.transient,
            )
            .await
            .map_err(|failure| failure.error)?;

        let stream = try_stream! {
            let mut bytes = Box::pin(response.bytes_stream());
            let mut decoder = SseDecoder::default();
            let mut done = false;
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|err| AgentError::LanguageModel(format!("stream error: {err}")))?;
                for data in decoder.push(&chunk) {
                    match parse_stream_payload(&data)? {
                        StreamPayload::Done => done = true,
                        StreamPayload::Delta(delta) if !done => {
                            yield delta;
                        }
                        _ => {}
                    }
                }
                if done {
                    break;
                }
            }
            if !done {
                for data in decoder.finish() {
                    if let StreamPayload::Delta(delta) = parse_stream_payload(&data)? {
                        yield delta;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|message| WireMessage {
            role: message.role.as_str().to_string(),
            content: match message.role {
                // tool results must always carry a string body
                Role::Tool => Some(message.text().to_string()),
                _ => message.content.clone(),
            },
            tool_call_id: message.tool_call_id.clone(),
            name: match message.role {
                Role::Tool => message.name.clone(),
                _ => None,
            },
            tool_calls: if message.tool_calls.is_empty() {
                None
            } else {
                Some(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| WireToolCall {
                            id: call.id.clone(),
                            r#type: "function".to_string(),
                            function: WireFunctionCall {
                                name: call.name.clone(),
                                arguments: if call.arguments.trim().is_empty() {
                                    "{}".to_string()
                                } else {
                                    call.arguments.clone()
                                },
                            },
                        })
                        .collect(),
                )
            },
        })
        .collect()
}

fn to_wire_tools(tools: &[ToolDescription]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|tool| WireTool {
            r#type: "function".to_string(),
            function: WireFunction {
                name: tool.name.clone(),
                description: Some(tool.description.clone()),
                parameters: Some(
                    tool.parameters
                        .clone()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                ),
            },
        })
        .collect()
}

/// A deterministic model used for tests and demos.
///
/// Each script entry drives one completion. JSON directives select the
/// shape of the stream; any other text is streamed back as the answer.
pub struct StubModel {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<StubRequest>>,
}

/// What the stub saw on one call.
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond {
        content: String,
    },
    CallTool {
        name: String,
        arguments: Value,
        /// Text streamed before the call.
        #[serde(default)]
        content: Option<String>,
    },
    /// Like `call_tool`, but `arguments` is sent as-is, valid JSON or not.
    CallToolRaw {
        name: String,
        arguments: String,
    },
    CallTools {
        calls: Vec<StubCall>,
    },
}

#[derive(Debug, Deserialize)]
struct StubCall {
    name: String,
    arguments: Value,
}

impl StubCall {
    fn into_raw(self) -> (String, String) {
        (self.name, self.arguments.to_string())
    }
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<StubRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn text_deltas(content: &str) -> Vec<ChatDelta> {
        let mut deltas: Vec<ChatDelta> = content.split_inclusive(' ').map(ChatDelta::text).collect();
        match deltas.last_mut() {
            Some(last) => last.finish_reason = Some("stop".into()),
            None => deltas.push(ChatDelta {
                finish_reason: Some("stop".into()),
                ..ChatDelta::default()
            }),
        }
        deltas
    }

    fn call_deltas(serial: usize, calls: Vec<(String, String)>) -> Vec<ChatDelta> {
        let mut deltas = Vec::new();
        for (index, (name, arguments)) in calls.into_iter().enumerate() {
            let chars: Vec<char> = arguments.chars().collect();
            let (head, tail) = chars.split_at(chars.len() / 2);
            deltas.push(ChatDelta {
                tool_calls: vec![ToolCallDelta {
                    index,
                    id: Some(format!("call_stub_{serial}_{index}")),
                    name: Some(name),
                    arguments: Some(head.iter().collect()),
                }],
                ..ChatDelta::default()
            });
            deltas.push(ChatDelta {
                tool_calls: vec![ToolCallDelta {
                    index,
                    arguments: Some(tail.iter().collect()),
                    ..ToolCallDelta::default()
                }],
                ..ChatDelta::default()
            });
        }
        if let Some(last) = deltas.last_mut() {
            last.finish_reason = Some("tool_calls".into());
        }
        deltas
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ChatStream> {
        let serial = {
            let mut requests = self
                .requests
                .lock()
                .map_err(|_| AgentError::LanguageModel("stub model poisoned".into()))?;
            requests.push(StubRequest {
                messages: messages.to_vec(),
                tools: tools.iter().map(|tool| tool.name.clone()).collect(),
            });
            requests.len()
        };
        let raw = self
            .responses
            .lock()
            .map_err(|_| AgentError::LanguageModel("stub model poisoned".into()))?
            .pop_front()
            .ok_or_else(|| {
                AgentError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;

        let deltas = match serde_json::from_str::<StubDirective>(&raw) {
            Ok(StubDirective::Respond { content }) => Self::text_deltas(&content),
            Ok(StubDirective::CallTool {
                name,
                arguments,
                content,
            }) => {
                let mut deltas: Vec<ChatDelta> = content
                    .as_deref()
                    .map(|text| text.split_inclusive(' ').map(ChatDelta::text).collect())
                    .unwrap_or_default();
                deltas.extend(Self::call_deltas(
                    serial,
                    vec![(name, arguments.to_string())],
                ));
                deltas
            }
            Ok(StubDirective::CallToolRaw { name, arguments }) => {
                Self::call_deltas(serial, vec![(name, arguments)])
            }
            Ok(StubDirective::CallTools { calls }) => Self::call_deltas(
                serial,
                calls.into_iter().map(StubCall::into_raw).collect(),
            ),
            Err(_) => Self::text_deltas(&raw),
        };
        Ok(futures::stream::iter(deltas.into_iter().map(Ok)).boxed())
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    r#type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireDeltaChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireDeltaChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
