use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::{AgentConfig, ServerTransport};
use crate::error::{AgentError, Result};
use crate::hooks::{AgentHook, ConfirmationHandler};
use crate::llm::{ChatCompletionClient, ChatDelta, CompletionAssembler, LanguageModel};
use crate::mcp::{HttpTransport, McpClient, McpServer, McpTools, SseTransport, ToolServer};
use crate::message::{Message, Role, ToolCall};
use crate::metrics::{ExitReason, MetricsTracker, RunGuard, RunReport};
use crate::tool::{ToolDescription, ToolRegistry};

pub const DEFAULT_MAX_TURNS: usize = 10;

/// Ends the run: the task is done.
pub const TASK_COMPLETE_TOOL: &str = "task_complete";
/// Ends the run: the user has to answer a question first.
pub const ASK_QUESTION_TOOL: &str = "ask_question";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an agent. Keep working until the user's request is fully resolved before ending your turn. \
Use the available tools to gather information instead of guessing. \
Think through each step before calling a tool and check its result afterwards. \
Call `task_complete` when the task is done, or `ask_question` when you need more information from the user.";

/// Something the run loop surfaced while it was working.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A streamed chunk of model output, forwarded as it arrived.
    Delta(ChatDelta),
    /// The transcript entry produced by one tool call.
    ToolResult(Message),
}

fn exit_tools() -> [ToolDescription; 2] {
    let no_arguments = json!({"type": "object", "properties": {}});
    [
        ToolDescription {
            name: TASK_COMPLETE_TOOL.to_string(),
            description: "Call this tool when the task given by the user is complete.".to_string(),
            parameters: Some(no_arguments.clone()),
        },
        ToolDescription {
            name: ASK_QUESTION_TOOL.to_string(),
            description: "Ask the user a question to get information needed to solve or clarify their problem."
                .to_string(),
            parameters: Some(no_arguments),
        },
    ]
}

fn is_exit_tool(name: &str) -> bool {
    name == TASK_COMPLETE_TOOL || name == ASK_QUESTION_TOOL
}

fn is_substantive_text(delta: &ChatDelta) -> bool {
    delta
        .content
        .as_deref()
        .is_some_and(|text| !text.trim().is_empty())
}

/// Console rendering of an event; `None` when there is nothing to show.
pub fn render_event(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::Delta(delta) => delta.content.clone(),
        AgentEvent::ToolResult(message) => {
            let name = message.name.as_deref().unwrap_or("tool");
            if is_exit_tool(name) {
                return None;
            }
            Some(format!("\n[{name}] {}\n", message.text()))
        }
    }
}

/// A tool-augmented agent streaming between a language model and its tool servers.
pub struct Agent<M: LanguageModel> {
    system_prompt: String,
    model: Arc<M>,
    tools: ToolRegistry,
    servers: Vec<(Arc<dyn ToolServer>, McpTools)>,
    messages: Vec<Message>,
    max_turns: usize,
    hooks: Vec<Arc<dyn AgentHook>>,
    confirmation_handler: Option<Arc<dyn ConfirmationHandler>>,
    metrics: Option<MetricsTracker>,
    last_report: Option<RunReport>,
}

impl<M: LanguageModel> Agent<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            model,
            tools: ToolRegistry::new(),
            servers: Vec::new(),
            messages: Vec::new(),
            max_turns: DEFAULT_MAX_TURNS,
            hooks: Vec::new(),
            confirmation_handler: None,
            metrics: None,
            last_report: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_server(self, server: Arc<dyn ToolServer>) -> Self {
        self.with_tool_server(server, McpTools::new())
    }

    /// Attach a server whose tools are loaded through `loader` (e.g. with a prefix).
    pub fn with_tool_server(mut self, server: Arc<dyn ToolServer>, loader: McpTools) -> Self {
        self.servers.push((server, loader));
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn AgentHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn require_tool_confirmation(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation_handler = Some(handler);
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsTracker) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }

    /// Query every attached server and merge its tools into the registry.
    pub async fn load_tools(&mut self) -> Result<usize> {
        let mut added = 0;
        for (server, loader) in &self.servers {
            added += loader
                .register_tools(Arc::clone(server), &mut self.tools)
                .await?;
        }
        Ok(added)
    }

    pub async fn close(&self) {
        for (server, _) in &self.servers {
            if let Err(err) = server.close().await {
                tracing::warn!(server = %server.label(), error = %err, "failed to close tool server");
            }
        }
    }

    fn advertised_tools(&self) -> Vec<ToolDescription> {
        let mut tools = self.tools.describe();
        tools.extend(exit_tools());
        tools
    }

    /// Run one prompt, streaming model chunks and tool results as they happen.
    pub fn run<'a>(
        &'a mut self,
        input: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentEvent>> + 'a {
        let input = input.into();
        try_stream! {
            if self.messages.is_empty() {
                self.messages.push(Message::system(self.system_prompt.clone()));
            }
            self.messages.push(Message::user(input));

            let mut guard = match &self.metrics {
                Some(metrics) => metrics.start_run(),
                None => RunGuard::detached(),
            };
            let mut expect_tool_call = true;

            let exit = loop {
                let turn = guard.turns();
                // a text answer right after tool use gets one more turn to call a tool
                let continuation = turn > 0 && expect_tool_call;
                if turn >= self.max_turns {
                    break if continuation { ExitReason::Answered } else { ExitReason::MaxTurns };
                }

                for hook in &self.hooks {
                    hook.before_model(&self.messages).await?;
                }
                let tools = self.advertised_tools();
                tracing::debug!(turn = turn + 1, continuation, "starting model turn");
                let mut stream = self.model.stream_chat(&self.messages, &tools).await?;
                guard.record_turn();

                let mut assembler = CompletionAssembler::default();
                let mut pending: Vec<ChatDelta> = Vec::new();
                let mut decided = !continuation;
                let mut abandoned = false;
                while let Some(delta) = stream.next().await {
                    let delta = delta?;
                    if !decided {
                        if delta.has_tool_calls() {
                            decided = true;
                            for held in pending.drain(..) {
                                assembler.push(&held);
                                yield AgentEvent::Delta(held);
                            }
                        } else if is_substantive_text(&delta) {
                            abandoned = true;
                            break;
                        } else {
                            pending.push(delta);
                            continue;
                        }
                    }
                    assembler.push(&delta);
                    yield AgentEvent::Delta(delta);
                }
                drop(stream);

                if abandoned || !decided {
                    tracing::debug!("continuation turn produced no tool call, ending run");
                    break ExitReason::Answered;
                }

                let message = assembler.finish();
                for hook in &self.hooks {
                    hook.after_model(&message).await?;
                }
                let calls = message.tool_calls.clone();
                self.messages.push(message);

                if calls.is_empty() {
                    if expect_tool_call {
                        break ExitReason::Answered;
                    }
                    expect_tool_call = true;
                    continue;
                }

                let mut exit_tool: Option<String> = None;
                for (index, call) in calls.iter().enumerate() {
                    if let Some(exit_name) = &exit_tool {
                        // keep the transcript well formed for the next run
                        self.messages.push(Message::tool_result(
                            call,
                            format!("Skipped: the run ended with `{exit_name}`"),
                        ));
                        continue;
                    }
                    if is_exit_tool(&call.name) {
                        let result = Message::tool_result(call, "");
                        self.messages.push(result.clone());
                        exit_tool = Some(call.name.clone());
                        yield AgentEvent::ToolResult(result);
                        continue;
                    }

                    guard.record_tool_call();
                    let result = match self.run_tool_call(call, &mut guard).await {
                        Ok(result) => result,
                        Err(err) => {
                            self.answer_aborted_calls(&calls[index..], &err);
                            Err::<Message, _>(err)?
                        }
                    };
                    self.messages.push(result.clone());
                    yield AgentEvent::ToolResult(result);
                }

                if let Some(name) = exit_tool {
                    break ExitReason::ExitTool(name);
                }
                expect_tool_call = false;
            };

            tracing::info!(turns = guard.turns(), exit = ?exit, "agent run finished");
            self.last_report = Some(guard.finish(exit));
        }
    }

    /// One non-exit tool call with its hooks around it.
    async fn run_tool_call(&self, call: &ToolCall, guard: &mut RunGuard) -> Result<Message> {
        for hook in &self.hooks {
            hook.before_tool_call(call).await?;
        }
        let (result, failed) = self.execute_tool_call(call).await?;
        if failed {
            guard.record_failure();
        }
        for hook in &self.hooks {
            hook.after_tool_result(&result).await?;
        }
        Ok(result)
    }

    /// Every tool call in the transcript needs an answer, even when the run
    /// stops halfway through a turn.
    fn answer_aborted_calls(&mut self, calls: &[ToolCall], err: &AgentError) {
        for call in calls {
            self.messages.push(Message::tool_result(
                call,
                format!("Error: run aborted: {err}"),
            ));
        }
    }

    /// Returns the transcript entry for `call` and whether the call failed.
    async fn execute_tool_call(&self, call: &ToolCall) -> Result<(Message, bool)> {
        if let Some(handler) = &self.confirmation_handler {
            if !handler.confirm_tool_call(call).await? {
                tracing::info!(tool = %call.name, "tool call rejected");
                return Ok((
                    Message::tool_result(call, "Error: tool call rejected by confirmation handler"),
                    false,
                ));
            }
        }
        if !self.tools.contains(&call.name) {
            tracing::warn!(tool = %call.name, "model requested an unknown tool");
            return Ok((
                Message::tool_result(call, format!("Error: no tool named `{}`", call.name)),
                true,
            ));
        }
        let arguments = match call.parsed_arguments() {
            Ok(arguments) => arguments,
            Err(err) => {
                tracing::warn!(tool = %call.name, arguments = %call.arguments, "invalid tool arguments");
                return Ok((
                    Message::tool_result(
                        call,
                        format!("Error: invalid arguments for `{}`: {err}", call.name),
                    ),
                    true,
                ));
            }
        };

        tracing::debug!(tool = %call.name, "calling tool");
        match self.tools.call(&call.name, arguments).await {
            Ok(output) => Ok((Message::tool_result(call, output.content), output.is_error)),
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool call failed");
                Ok((Message::tool_result(call, format!("Error: {err}")), true))
            }
        }
    }

    /// Drive a full run and return the last assistant text it produced.
    pub async fn respond(&mut self, input: impl Into<String>) -> Result<String> {
        let start = self.messages.len();
        {
            let stream = self.run(input);
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                event?;
            }
        }
        Ok(self.messages[start..]
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.text().is_empty())
            .map(|m| m.text().to_string())
            .unwrap_or_default())
    }

    /// Drive a full run, writing text chunks and tool results to `writer` as they arrive.
    pub async fn stream_to<W>(&mut self, input: impl Into<String>, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        {
            let stream = self.run(input);
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if let Some(text) = render_event(&event?) {
                    writer.write_all(text.as_bytes()).await?;
                    writer.flush().await?;
                }
            }
        }
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Agent<ChatCompletionClient> {
    /// Build the chat client and one HTTP tool server per `[[servers]]` entry.
    /// Tools are not loaded until [`Agent::load_tools`] runs.
    pub fn from_config(cfg: &AgentConfig) -> Result<Self> {
        cfg.validate()?;
        let model = Arc::new(ChatCompletionClient::from_config(&cfg.model)?);
        let mut agent = Agent::new(model).with_max_turns(cfg.agent.max_turns);
        if let Some(prompt) = &cfg.agent.system_prompt {
            agent = agent.with_system_prompt(prompt.clone());
        }
        for server in &cfg.servers {
            let timeout = Duration::from_secs(server.timeout_secs);
            let handle: Arc<dyn ToolServer> = match server.transport {
                ServerTransport::Http => {
                    let transport =
                        HttpTransport::with_headers(&server.url, server.headers.clone(), timeout)?;
                    Arc::new(McpServer::new(server.name.clone(), McpClient::new(transport)))
                }
                ServerTransport::Sse => {
                    let transport =
                        SseTransport::with_headers(&server.url, server.headers.clone(), timeout)?;
                    Arc::new(McpServer::new(server.name.clone(), McpClient::new(transport)))
                }
            };
            let loader = match &server.prefix {
                Some(prefix) => McpTools::new().with_prefix(prefix.clone()),
                None => McpTools::new(),
            };
            agent = agent.with_tool_server(handle, loader);
        }
        Ok(agent)
    }
}
