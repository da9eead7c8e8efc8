use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use av_core::{
    CompletionRequest, CompletionResponse, Content, ContentPart, Error, FinishReason, HostedTool,
    Message, Provider, Role, StreamChunk, StreamResult, ToolCall, ToolDefinition, Usage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions transport for OpenAI and OpenAI-protocol servers.
pub struct OpenAIProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        // Configure client for proper SSE streaming:
        // - Use HTTP/1.1 to avoid HTTP/2 framing issues
        // - Disable automatic decompression which can buffer entire response
        let client = Client::builder()
            .http1_only()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            name: "openai".to_string(),
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Name reported in logs and model handles; usually the provider id.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request(&self, request: &CompletionRequest) -> OpenAIChatRequest {
        let messages: Vec<OpenAIMessage> = request.messages.iter().map(convert_message).collect();

        let mut tools: Vec<Value> = request.tools.iter().map(convert_tool).collect();
        tools.extend(request.hosted_tools.iter().filter_map(convert_hosted_tool));

        OpenAIChatRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stream: Some(request.stream),
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream_options: request.stream.then_some(StreamOptions {
                include_usage: true,
            }),
            extra: request.extra.clone(),
        }
    }

    fn parse_response(&self, response: OpenAIChatResponse) -> Result<CompletionResponse, Error> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::api(500, "No choices in response"))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                ToolCall::new(
                    tc.id,
                    tc.function.name,
                    serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
                )
            })
            .collect();

        let thinking = choice.message.reasoning_content;
        let content = choice.message.content.unwrap_or_default();

        let message = if tool_calls.is_empty() {
            Message::assistant(content)
        } else {
            Message::assistant_with_tool_calls(content, tool_calls)
        };

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };

        Ok(CompletionResponse {
            message,
            thinking,
            usage: response
                .usage
                .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default(),
            model: response.model,
            finish_reason,
        })
    }

    async fn post(&self, api_request: &OpenAIChatRequest) -> Result<reqwest::Response, Error> {
        let mut builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        if api_request.stream == Some(true) {
            builder = builder
                .header("Accept", "text/event-stream")
                .header("Accept-Encoding", "identity")
                .header("Cache-Control", "no-cache");
        }

        let response = builder
            .json(api_request)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(parse_error(status.as_u16(), &error_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let mut req = request;
        req.stream = false;

        let api_request = self.build_request(&req);
        debug!(provider = %self.name, model = ?api_request.model, "Sending completion request");

        let response = self.post(&api_request).await?;
        let api_response: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;

        self.parse_response(api_response)
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        let mut req = request;
        req.stream = true;

        let api_request = self.build_request(&req);
        debug!(provider = %self.name, model = ?api_request.model, "Sending stream request");

        let mut response = self.post(&api_request).await?;
        let (tx, rx) = mpsc::channel::<Result<StreamChunk, Error>>(100);

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();

            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(Error::network(e.to_string()))).await;
                        return;
                    }
                };

                for event in decoder.push(&chunk) {
                    let finished = matches!(event, SseEvent::Finished);
                    for out in event.into_chunks() {
                        if tx.send(Ok(out)).await.is_err() {
                            return;
                        }
                    }
                    if finished {
                        return;
                    }
                }
            }

            let _ = tx.send(Ok(StreamChunk::Done { usage: None })).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as StreamResult)
    }
}

fn parse_error(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => match status {
            401 | 403 => Error::auth(err.error.message),
            404 => Error::ModelNotFound(err.error.message),
            429 => Error::rate_limit(err.error.message),
            400 => Error::invalid_request(err.error.message),
            _ => Error::api(status, err.error.message),
        },
        Err(_) => Error::api(status, body.to_string()),
    }
}

fn convert_message(message: &Message) -> OpenAIMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let content = match &message.content {
        Content::Text(s) => Some(s.clone()),
        Content::Parts(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Refusal { .. } => None,
                })
                .collect();
            (!text.is_empty()).then_some(text)
        }
    };

    let tool_calls = (!message.tool_calls.is_empty()).then(|| {
        message
            .tool_calls
            .iter()
            .map(|tc| OpenAIToolCall {
                id: tc.id.clone(),
                r#type: "function".to_string(),
                function: OpenAIFunctionCall {
                    name: tc.name.clone(),
                    arguments: tc.arguments.to_string(),
                },
            })
            .collect()
    });

    OpenAIMessage {
        role: role.to_string(),
        content,
        reasoning_content: None, // never sent back, only received
        name: message.name.clone(),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
            "strict": tool.strict,
        }
    })
}

fn convert_hosted_tool(tool: &HostedTool) -> Option<Value> {
    match serde_json::to_value(tool) {
        Ok(value) => Some(value),
        Err(e) => {
            error!(kind = %tool.kind, error = %e, "Dropping unserializable hosted tool");
            None
        }
    }
}

/// One decoded SSE `data:` payload.
#[derive(Debug)]
enum SseEvent {
    Payload(OpenAIStreamResponse),
    Finished,
}

impl SseEvent {
    fn into_chunks(self) -> Vec<StreamChunk> {
        let response = match self {
            SseEvent::Finished => return vec![StreamChunk::Done { usage: None }],
            SseEvent::Payload(response) => response,
        };

        let mut out = Vec::new();
        for choice in response.choices {
            if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
                out.push(StreamChunk::ThinkingDelta { content: reasoning });
            }
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push(StreamChunk::Delta { content });
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                if let Some(id) = tc.id {
                    let name = tc.function.as_ref().and_then(|f| f.name.clone()).unwrap_or_default();
                    out.push(StreamChunk::ToolCallStart { id, name });
                }
                if let Some(arguments) = tc.function.and_then(|f| f.arguments).filter(|a| !a.is_empty()) {
                    out.push(StreamChunk::ToolCallDelta { arguments });
                }
            }
            if choice.finish_reason.is_some() {
                let usage = response
                    .usage
                    .as_ref()
                    .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));
                out.push(StreamChunk::Done { usage });
            }
        }
        out
    }
}

/// Incremental splitter for `\n\n`-separated SSE events.
#[derive(Default)]
struct SseDecoder {
    // Raw bytes: a chunk may end inside a multi-byte character
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let Ok(block) = std::str::from_utf8(&block) else {
                error!("Invalid UTF-8 in SSE event");
                continue;
            };
            for line in block.lines() {
                let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
                    continue;
                };
                if data == "[DONE]" {
                    events.push(SseEvent::Finished);
                    continue;
                }
                match serde_json::from_str::<OpenAIStreamResponse>(data) {
                    Ok(response) => events.push(SseEvent::Payload(response)),
                    Err(e) => error!("Failed to parse SSE message: {} - data: {}", e, data),
                }
            }
        }
        events
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    /// Model to use. Optional for servers that have a default model.
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    /// Function tools followed by hosted tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    /// tool_choice, parallel_tool_calls and any model-specific settings
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    r#type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<OpenAIStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamToolCall {
    id: Option<String>,
    function: Option<OpenAIStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_name_and_base_url() {
        let provider = OpenAIProvider::new("test-key")
            .with_name("local")
            .with_base_url("http://localhost:8080/v1/");
        assert_eq!(provider.name(), "local");
        assert_eq!(provider.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_build_request_merges_function_and_hosted_tools() {
        let provider = OpenAIProvider::new("test-key");
        let mut extra = HashMap::new();
        extra.insert("tool_choice".to_string(), json!("auto"));

        let request = CompletionRequest::new(vec![Message::user("Hello")])
            .with_model("gpt-5")
            .with_tools(vec![ToolDefinition::new("echo", "Echo text")])
            .with_hosted_tools(vec![HostedTool::new("web_search")])
            .with_extra(extra);
        let body = serde_json::to_value(provider.build_request(&request)).unwrap();

        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "echo");
        assert_eq!(body["tools"][1]["type"], "web_search");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_build_request_without_tools_or_model() {
        let provider = OpenAIProvider::new("test-key");
        let request = CompletionRequest::new(vec![Message::user("Hello")]).with_stream(false);
        let body = serde_json::to_value(provider.build_request(&request)).unwrap();

        assert!(body.get("model").is_none());
        assert!(body.get("tools").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let provider = OpenAIProvider::new("k");
        let raw: OpenAIChatResponse = serde_json::from_value(json!({
            "model": "gpt-5",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "echo", "arguments": "{\"text\":\"hi\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4}
        }))
        .unwrap();

        let response = provider.parse_response(raw).unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.message.tool_calls[0].arguments["text"], "hi");
        assert_eq!(response.usage.total_tokens, 7);
    }

    #[test]
    fn test_sse_decoder_handles_split_events() {
        let mut decoder = SseDecoder::default();
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n");
        assert!(first.is_empty());

        let events = decoder.push(
            b"\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n",
        );
        let chunks: Vec<StreamChunk> = events.into_iter().flat_map(SseEvent::into_chunks).collect();

        let text: String = chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::Delta { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));
    }

    #[test]
    fn test_sse_decoder_keeps_characters_split_across_chunks() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9}\"},\"finish_reason\":null}]}\n\n";
        let bytes = event.as_bytes();
        // Cut between the two bytes of the accented character
        let cut = event.find('\u{e9}').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&bytes[..cut]).is_empty());
        let chunks: Vec<StreamChunk> = decoder
            .push(&bytes[cut..])
            .into_iter()
            .flat_map(SseEvent::into_chunks)
            .collect();

        assert!(matches!(
            chunks.as_slice(),
            [StreamChunk::Delta { content }] if content == "caf\u{e9}"
        ));
    }

    #[test]
    fn test_parse_error_statuses() {
        let body = r#"{"error":{"message":"bad key","type":"invalid_request_error"}}"#;
        assert!(parse_error(401, body).is_auth_error());
        assert!(matches!(parse_error(429, body), Error::RateLimit(_)));
        assert!(matches!(parse_error(500, "oops"), Error::Api { status: 500, .. }));
    }
}
