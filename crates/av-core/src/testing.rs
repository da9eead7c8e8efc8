//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::message::{Message, StreamChunk, ToolCall, Usage};
use crate::provider::{
    CompletionRequest, CompletionResponse, FinishReason, ModelHandle, Provider, ProviderAdapter,
    StreamResult,
};
use crate::tool::{
    ParameterSchema, PropertySchema, Tool, ToolContext, ToolDefinition, ToolExecutor, ToolOutput,
    ToolParameters,
};

enum MockReply {
    Response(CompletionResponse),
    Fail(Error),
    /// Stream some text, then fail mid-stream.
    BrokenStream { partial: String, message: String },
}

/// A mock provider that returns pre-configured responses.
pub struct MockProvider {
    replies: Mutex<Vec<MockReply>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            captured_requests: Mutex::new(Vec::new()),
            name: "mock".to_string(),
        }
    }

    fn push(&self, reply: MockReply) {
        // FIFO: first queued = first returned
        self.replies.lock().unwrap().insert(0, reply);
    }

    /// Queue a plain text answer.
    pub fn queue_response(&self, content: &str) {
        self.push(MockReply::Response(CompletionResponse {
            message: Message::assistant(content),
            thinking: None,
            usage: Usage::new(10, 5),
            model: "mock-model".to_string(),
            finish_reason: FinishReason::Stop,
        }));
    }

    /// Queue a turn that asks for one tool call.
    pub fn queue_tool_call(&self, id: &str, name: &str, arguments: Value) {
        self.queue_text_with_tool_call("", id, name, arguments);
    }

    /// Queue a turn that says `text` and then asks for one tool call.
    pub fn queue_text_with_tool_call(&self, text: &str, id: &str, name: &str, arguments: Value) {
        self.push(MockReply::Response(CompletionResponse {
            message: Message::assistant_with_tool_calls(text, vec![ToolCall::new(id, name, arguments)]),
            thinking: None,
            usage: Usage::new(10, 5),
            model: "mock-model".to_string(),
            finish_reason: FinishReason::ToolCalls,
        }));
    }

    /// Queue a failure returned from the call itself.
    pub fn queue_error(&self, error: Error) {
        self.push(MockReply::Fail(error));
    }

    /// Queue a stream that emits `partial` and then breaks.
    pub fn queue_broken_stream(&self, partial: &str, message: &str) {
        self.push(MockReply::BrokenStream {
            partial: partial.to_string(),
            message: message.to_string(),
        });
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    /// Get the last captured request.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }

    fn next_reply(&self, request: CompletionRequest) -> Result<MockReply, Error> {
        self.captured_requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| Error::Unknown("No mock response queued".to_string()))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        match self.next_reply(request)? {
            MockReply::Response(response) => Ok(response),
            MockReply::Fail(error) => Err(error),
            MockReply::BrokenStream { message, .. } => Err(Error::stream(message)),
        }
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        let mut chunks: Vec<Result<StreamChunk, Error>> = vec![Ok(StreamChunk::Start {
            model: "mock-model".to_string(),
        })];

        match self.next_reply(request)? {
            MockReply::Fail(error) => return Err(error),
            MockReply::BrokenStream { partial, message } => {
                if !partial.is_empty() {
                    chunks.push(Ok(StreamChunk::Delta { content: partial }));
                }
                chunks.push(Ok(StreamChunk::Error { message }));
            }
            MockReply::Response(response) => {
                let text = response.message.content.to_string_lossy();
                // Split into two deltas so consumers see incremental text
                let mid = text.char_indices().nth(text.chars().count() / 2).map(|(i, _)| i);
                match mid {
                    Some(mid) if mid > 0 => {
                        chunks.push(Ok(StreamChunk::Delta { content: text[..mid].to_string() }));
                        chunks.push(Ok(StreamChunk::Delta { content: text[mid..].to_string() }));
                    }
                    _ if !text.is_empty() => chunks.push(Ok(StreamChunk::Delta { content: text })),
                    _ => {}
                }
                for call in response.message.tool_calls {
                    chunks.push(Ok(StreamChunk::ToolCallStart {
                        id: call.id,
                        name: call.name,
                    }));
                    chunks.push(Ok(StreamChunk::ToolCallDelta {
                        arguments: call.arguments.to_string(),
                    }));
                }
                chunks.push(Ok(StreamChunk::Done {
                    usage: Some(response.usage),
                }));
            }
        }

        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Adapter serving a fixed provider, for wiring tests without credentials.
pub struct StaticAdapter {
    id: String,
    provider: Arc<dyn Provider>,
    models: Vec<String>,
    initialized: AtomicBool,
    fail_init: bool,
}

impl StaticAdapter {
    pub fn new(id: impl Into<String>, provider: Arc<dyn Provider>, models: Vec<String>) -> Self {
        Self {
            id: id.into(),
            provider,
            models,
            initialized: AtomicBool::new(false),
            fail_init: false,
        }
    }

    /// Make `initialize` fail as if credentials were missing.
    pub fn failing(mut self) -> Self {
        self.fail_init = true;
        self
    }
}

#[async_trait]
impl ProviderAdapter for StaticAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<(), Error> {
        if self.fail_init {
            return Err(Error::auth(format!("{}: API key missing", self.id)));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn model(&self, model_id: &str) -> Result<ModelHandle, Error> {
        if !self.is_initialized() {
            return Err(Error::config(format!("provider {} is not initialized", self.id)));
        }
        Ok(ModelHandle::new(Arc::clone(&self.provider), model_id))
    }

    fn available_models(&self) -> Vec<String> {
        self.models.clone()
    }
}

/// Executor returning its `text` argument unchanged.
pub struct EchoExecutor;

#[async_trait]
impl ToolExecutor for EchoExecutor {
    async fn call(&self, arguments: Value, _ctx: &ToolContext) -> Result<Value, Error> {
        arguments
            .get("text")
            .cloned()
            .ok_or_else(|| Error::tool("echo", "missing 'text' argument"))
    }

    fn parameters(&self) -> Option<ParameterSchema> {
        Some(
            ToolParameters::new()
                .add_property("text", PropertySchema::string("Text to echo back"), true)
                .into(),
        )
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the text argument"
    }

    fn definition(&self) -> ToolDefinition {
        let params = EchoExecutor.parameters().unwrap_or(ParameterSchema::Json(Value::Null));
        ToolDefinition::new(self.name(), self.description()).with_parameters(&params)
    }

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolOutput, Error> {
        let value = EchoExecutor.call(arguments, ctx).await?;
        Ok(ToolOutput::success(value.as_str().unwrap_or_default()))
    }
}

/// A ready-made runtime tool named `echo`.
pub fn echo_tool() -> Arc<dyn Tool> {
    Arc::new(EchoTool)
}
