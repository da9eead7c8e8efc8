use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            Content::Parts(parts) => {
                if parts.len() == 1 {
                    if let ContentPart::Text { text } = &parts[0] {
                        return Some(text);
                    }
                }
                None
            }
        }
    }

    pub fn to_string_lossy(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Refusal { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Refusal { refusal: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A chat-completions style message, the wire shape sent to providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: Content) -> Self {
        Self {
            role,
            content,
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    pub fn assistant_with_tool_calls(content: impl Into<Content>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content.into())
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, Content::text(content))
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    Start {
        model: String,
    },
    Delta {
        content: String,
    },
    ThinkingDelta {
        content: String,
    },
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        arguments: String,
    },
    Done {
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
}

// =============================================================================
// Session items
// =============================================================================

/// Completion state of an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Incomplete,
}

/// One entry of a conversation log.
///
/// This is the unit a session persists. Variants outside this set
/// deserialize as [`AgentInputItem::Unknown`] so older or newer rows never
/// break a session load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentInputItem {
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
        status: ItemStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    SystemMessage {
        content: String,
    },
    HostedToolCall {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallResult {
        call_id: String,
        name: String,
        output: String,
    },
    Reasoning {
        content: String,
    },
    #[serde(other)]
    Unknown,
}

impl AgentInputItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self::UserMessage {
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::SystemMessage {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::AssistantMessage {
            content: content.into(),
            status: ItemStatus::Completed,
            agent: None,
        }
    }

    pub fn assistant_from(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self::AssistantMessage {
            content: content.into(),
            status: ItemStatus::Completed,
            agent: Some(agent.into()),
        }
    }

    /// Text carried by message-like items.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::UserMessage { content }
            | Self::AssistantMessage { content, .. }
            | Self::SystemMessage { content } => Some(content),
            _ => None,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::UserMessage { .. })
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::AssistantMessage { .. })
    }
}

/// Convert a session log into provider messages.
///
/// Consecutive function calls are folded into one assistant message carrying
/// several tool calls. Reasoning, hosted tool calls and unknown items have no
/// chat-completions representation and are dropped.
pub fn items_to_messages(items: &[AgentInputItem]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::with_capacity(items.len());

    for item in items {
        match item {
            AgentInputItem::UserMessage { content } => messages.push(Message::user(content.as_str())),
            AgentInputItem::SystemMessage { content } => {
                messages.push(Message::system(content.as_str()))
            }
            AgentInputItem::AssistantMessage { content, .. } => {
                messages.push(Message::assistant(content.as_str()))
            }
            AgentInputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let args = serde_json::from_str(arguments)
                    .unwrap_or_else(|_| serde_json::Value::String(arguments.clone()));
                let call = ToolCall::new(call_id, name, args);
                match messages.last_mut() {
                    Some(last) if last.role == Role::Assistant && !last.tool_calls.is_empty() => {
                        last.tool_calls.push(call)
                    }
                    _ => messages.push(Message::assistant_with_tool_calls("", vec![call])),
                }
            }
            AgentInputItem::FunctionCallResult { call_id, output, .. } => {
                messages.push(Message::tool_result(call_id, output.as_str()))
            }
            AgentInputItem::HostedToolCall { .. }
            | AgentInputItem::Reasoning { .. }
            | AgentInputItem::Unknown => {}
        }
    }

    messages
}
