//! Runtime agents and the run loop.
//!
//! This module provides:
//! - `RuntimeAgent`, a fully wired agent (model, tools, handoffs)
//! - `Runner`, which drives the model/tool loop to a final output
//! - Streaming runs that report text deltas, tool activity and handoffs

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::definition::ModelSettings;
use crate::error::Error;
use crate::message::{items_to_messages, AgentInputItem, Message, StreamChunk, ToolCall, Usage};
use crate::provider::{CompletionRequest, ModelHandle};
use crate::tool::{HostedTool, Tool, ToolContext, ToolDefinition, ToolOutput};

pub const DEFAULT_MAX_TURNS: usize = 10;

/// Fill in the defaults an agent runs with: `tool_choice = "auto"` and
/// `parallel_tool_calls = false`.
pub fn adapt_model_settings(settings: Option<&ModelSettings>) -> ModelSettings {
    let mut adapted = settings.cloned().unwrap_or_default();
    if adapted.tool_choice.is_none() {
        adapted.tool_choice = Some("auto".to_string());
    }
    if adapted.parallel_tool_calls.is_none() {
        adapted.parallel_tool_calls = Some(false);
    }
    adapted
}

/// An agent ready to run.
pub struct RuntimeAgent {
    pub id: String,
    pub name: String,
    pub instructions: String,
    pub model: ModelHandle,
    pub model_settings: ModelSettings,
    pub tools: Vec<Arc<dyn Tool>>,
    pub hosted_tools: Vec<HostedTool>,
    pub handoffs: Vec<Arc<RuntimeAgent>>,
    pub output_type: Option<Value>,
}

impl RuntimeAgent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instructions: impl Into<String>,
        model: ModelHandle,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            instructions: instructions.into(),
            model,
            model_settings: adapt_model_settings(None),
            tools: Vec::new(),
            hosted_tools: Vec::new(),
            handoffs: Vec::new(),
            output_type: None,
        }
    }

    pub fn with_model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_hosted_tools(mut self, hosted_tools: Vec<HostedTool>) -> Self {
        self.hosted_tools = hosted_tools;
        self
    }

    pub fn with_handoffs(mut self, handoffs: Vec<Arc<RuntimeAgent>>) -> Self {
        self.handoffs = handoffs;
        self
    }

    pub fn with_output_type(mut self, output_type: Option<Value>) -> Self {
        self.output_type = output_type;
        self
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    fn handoff_for(&self, tool_name: &str) -> Option<&Arc<RuntimeAgent>> {
        self.handoffs
            .iter()
            .find(|h| handoff_tool_name(&h.name) == tool_name)
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.iter().map(|t| t.definition()).collect();
        for handoff in &self.handoffs {
            defs.push(ToolDefinition::new(
                handoff_tool_name(&handoff.name),
                format!("Hand off the conversation to the {} agent.", handoff.name),
            ));
        }
        defs
    }

    fn request(&self, history: &[Message], stream: bool) -> CompletionRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(self.instructions.as_str()));
        messages.extend_from_slice(history);

        let tools = self.definitions();
        let has_tools = !tools.is_empty() || !self.hosted_tools.is_empty();

        let mut extra = self.model_settings.extra.clone();
        if has_tools {
            if let Some(choice) = &self.model_settings.tool_choice {
                extra.insert("tool_choice".to_string(), Value::String(choice.clone()));
            }
            if let Some(parallel) = self.model_settings.parallel_tool_calls {
                extra.insert("parallel_tool_calls".to_string(), Value::Bool(parallel));
            }
        }

        let mut request = CompletionRequest::new(messages)
            .with_tools(tools)
            .with_hosted_tools(self.hosted_tools.clone())
            .with_stream(stream)
            .with_extra(extra);
        request.temperature = self.model_settings.temperature;
        request.top_p = self.model_settings.top_p;
        request.max_tokens = self.model_settings.max_tokens;
        request
    }
}

impl std::fmt::Debug for RuntimeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeAgent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &self.tool_names())
            .field("handoffs", &self.handoffs.iter().map(|h| h.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

/// Tool name under which a handoff target is offered to the model.
pub fn handoff_tool_name(agent_name: &str) -> String {
    let slug: String = agent_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("transfer_to_{}", slug)
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Final text, or the parsed JSON value when the agent declares an output type.
    pub final_output: Value,
    /// Name of the agent that produced the final output.
    pub last_agent: String,
    /// Items produced during the run, in order.
    pub new_items: Vec<AgentInputItem>,
    pub usage: Usage,
}

impl RunResult {
    pub fn final_text(&self) -> Option<&str> {
        self.final_output.as_str()
    }
}

/// Events reported by a streamed run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    TextDelta {
        delta: String,
    },
    ReasoningDelta {
        delta: String,
    },
    ToolCalled {
        agent_name: String,
        tool_name: String,
        call_id: String,
        arguments: String,
    },
    ToolOutput {
        tool_name: String,
        call_id: String,
        output: String,
        is_error: bool,
    },
    AgentUpdated {
        agent_name: String,
    },
    Completed(RunResult),
}

pub type RunStream = Pin<Box<dyn Stream<Item = Result<RunEvent, Error>> + Send>>;

/// Drives an agent through model turns and tool calls.
#[derive(Debug, Clone)]
pub struct Runner {
    max_turns: usize,
    session_id: Option<String>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            session_id: None,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Run to completion without streaming.
    pub async fn run(
        &self,
        agent: Arc<RuntimeAgent>,
        input: Vec<AgentInputItem>,
    ) -> Result<RunResult, Error> {
        self.run_loop(agent, input, None).await
    }

    /// Run with streamed events. The stream ends after `Completed` or the
    /// first error.
    pub fn run_streamed(&self, agent: Arc<RuntimeAgent>, input: Vec<AgentInputItem>) -> RunStream {
        let (tx, rx) = mpsc::channel::<Result<RunEvent, Error>>(100);
        let runner = self.clone();

        tokio::spawn(async move {
            let events = tx.clone();
            match runner.run_loop(agent, input, Some(&events)).await {
                Ok(result) => {
                    let _ = tx.send(Ok(RunEvent::Completed(result))).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn run_loop(
        &self,
        agent: Arc<RuntimeAgent>,
        input: Vec<AgentInputItem>,
        events: Option<&mpsc::Sender<Result<RunEvent, Error>>>,
    ) -> Result<RunResult, Error> {
        let mut current = agent;
        let mut history = items_to_messages(&input);
        let mut new_items = Vec::new();
        let mut usage = Usage::default();

        debug!(
            agent = %current.name,
            input_items = input.len(),
            tools_available = current.tools.len(),
            handoffs = current.handoffs.len(),
            streaming = events.is_some(),
            "Run starting"
        );

        for turn in 0..self.max_turns {
            debug!(agent = %current.name, turn = turn, messages = history.len(), "Turn starting");

            let (content, tool_calls, turn_usage) = match events {
                Some(tx) => run_streaming_turn(&current, &history, tx).await?,
                None => run_complete_turn(&current, &history).await?,
            };
            usage.add(&turn_usage);

            if tool_calls.is_empty() {
                let final_output = match &current.output_type {
                    Some(_) => serde_json::from_str(&content).unwrap_or(Value::String(content.clone())),
                    None => Value::String(content.clone()),
                };
                new_items.push(AgentInputItem::assistant_from(current.name.clone(), content));
                debug!(agent = %current.name, turns = turn + 1, "Run completed");
                return Ok(RunResult {
                    final_output,
                    last_agent: current.name.clone(),
                    new_items,
                    usage,
                });
            }

            if !content.is_empty() {
                new_items.push(AgentInputItem::assistant_from(current.name.clone(), content.clone()));
            }
            history.push(Message::assistant_with_tool_calls(content, tool_calls.clone()));

            let mut next_agent: Option<Arc<RuntimeAgent>> = None;
            for call in &tool_calls {
                let arguments = call.arguments.to_string();
                new_items.push(AgentInputItem::FunctionCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: arguments.clone(),
                });
                emit(
                    events,
                    RunEvent::ToolCalled {
                        agent_name: current.name.clone(),
                        tool_name: call.name.clone(),
                        call_id: call.id.clone(),
                        arguments,
                    },
                )
                .await;

                let result = if let Some(target) = current.handoff_for(&call.name) {
                    if next_agent.is_some() {
                        ToolOutput::error("Error: a handoff was already performed this turn")
                    } else {
                        next_agent = Some(Arc::clone(target));
                        ToolOutput::success(format!("Transferred to {}", target.name))
                    }
                } else {
                    let ctx = ToolContext {
                        agent_name: current.name.clone(),
                        session_id: self.session_id.clone(),
                    };
                    execute_tool(&current, call, &ctx).await
                };
                let ToolOutput {
                    content: output,
                    is_error,
                } = result;

                new_items.push(AgentInputItem::FunctionCallResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output: output.clone(),
                });
                emit(
                    events,
                    RunEvent::ToolOutput {
                        tool_name: call.name.clone(),
                        call_id: call.id.clone(),
                        output: output.clone(),
                        is_error,
                    },
                )
                .await;
                history.push(Message::tool_result(&call.id, output));
            }

            if let Some(next) = next_agent {
                debug!(from = %current.name, to = %next.name, "Handoff");
                emit(
                    events,
                    RunEvent::AgentUpdated {
                        agent_name: next.name.clone(),
                    },
                )
                .await;
                current = next;
            }
        }

        Err(Error::Unknown(format!(
            "Agent {} exceeded max turns ({})",
            current.name, self.max_turns
        )))
    }
}

async fn emit(events: Option<&mpsc::Sender<Result<RunEvent, Error>>>, event: RunEvent) {
    if let Some(tx) = events {
        // Receiver gone means nobody is listening; the run still finishes.
        let _ = tx.send(Ok(event)).await;
    }
}

async fn run_streaming_turn(
    agent: &RuntimeAgent,
    history: &[Message],
    events: &mpsc::Sender<Result<RunEvent, Error>>,
) -> Result<(String, Vec<ToolCall>, Usage), Error> {
    let mut stream = agent.model.stream(agent.request(history, true)).await?;

    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut current_tool_call: Option<(String, String, String)> = None;
    let mut usage = Usage::default();

    let finish_call = |pending: &mut Option<(String, String, String)>, calls: &mut Vec<ToolCall>| {
        if let Some((id, name, args)) = pending.take() {
            let args: Value = serde_json::from_str(&args).unwrap_or(Value::Null);
            calls.push(ToolCall::new(id, name, args));
        }
    };

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Start { .. } => {}
            StreamChunk::ThinkingDelta { content: delta } => {
                let _ = events.send(Ok(RunEvent::ReasoningDelta { delta })).await;
            }
            StreamChunk::Delta { content: delta } => {
                content.push_str(&delta);
                let _ = events.send(Ok(RunEvent::TextDelta { delta })).await;
            }
            StreamChunk::ToolCallStart { id, name } => {
                finish_call(&mut current_tool_call, &mut tool_calls);
                current_tool_call = Some((id, name, String::new()));
            }
            StreamChunk::ToolCallDelta { arguments } => {
                if let Some((_, _, ref mut args)) = current_tool_call {
                    args.push_str(&arguments);
                }
            }
            StreamChunk::Done { usage: u } => {
                finish_call(&mut current_tool_call, &mut tool_calls);
                if let Some(u) = u {
                    usage = u;
                }
            }
            StreamChunk::Error { message } => {
                debug!(agent = %agent.name, error = %message, "Stream error");
                return Err(Error::stream(message));
            }
        }
    }
    finish_call(&mut current_tool_call, &mut tool_calls);

    Ok((content, tool_calls, usage))
}

async fn run_complete_turn(
    agent: &RuntimeAgent,
    history: &[Message],
) -> Result<(String, Vec<ToolCall>, Usage), Error> {
    let response = agent.model.complete(agent.request(history, false)).await?;

    if let Some(ref thinking) = response.thinking {
        debug!(agent = %agent.name, thinking_len = thinking.len(), "Extracted thinking content (not stored)");
    }

    Ok((
        response.message.content.to_string_lossy(),
        response.message.tool_calls,
        response.usage,
    ))
}

/// Run a tool call. Failures become error outputs for the model to read.
async fn execute_tool(agent: &RuntimeAgent, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
    let Some(tool) = agent.tool(&call.name) else {
        return ToolOutput::error(format!("Error: Unknown tool '{}'", call.name));
    };

    match tool.execute(call.arguments.clone(), ctx).await {
        Ok(output) if output.is_error => ToolOutput::error(format!("Error: {}", output.content)),
        Ok(output) => output,
        Err(e) => ToolOutput::error(format!("Error executing tool: {}", e)),
    }
}
