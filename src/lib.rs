//! A small tool-calling agent runtime.
//!
//! The crate provides:
//! - A streaming language model abstraction (`LanguageModel`) with an
//!   OpenAI-compatible client routed through inference providers.
//! - A tool interface (`Tool` and `ToolRegistry`) fed by MCP servers.
//! - An `Agent` that loops between the model and its tools, streaming model
//!   chunks and tool results as they happen.

mod agent;
mod config;
mod error;
mod hooks;
mod llm;
pub mod mcp;
mod message;
mod metrics;
mod telemetry;
mod tool;

pub use agent::{
    render_event, Agent, AgentEvent, ASK_QUESTION_TOOL, DEFAULT_MAX_TURNS, DEFAULT_SYSTEM_PROMPT,
    TASK_COMPLETE_TOOL,
};
pub use config::{
    AgentConfig, LogFormat, LoggingConfig, ModelConfig, RunConfig, ServerConfig, ServerTransport,
};
pub use error::{AgentError, Result};
pub use hooks::{AgentHook, ConfirmationHandler};
pub use llm::{
    is_known_provider, resolve_base_url, ChatCompletionClient, ChatDelta, ChatStream,
    CompletionAssembler, LanguageModel, SseDecoder, SseEvent, StubModel, StubRequest, ToolCallDelta,
};
pub use message::{Message, Role, ToolCall};
pub use metrics::{ExitReason, MetricsTracker, RunGuard, RunReport};
pub use telemetry::{init_tracing, RetryPolicy};
pub use tool::{Tool, ToolDescription, ToolOutput, ToolRegistry};
