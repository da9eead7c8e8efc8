//! av-core: Core types and traits for agent-vault
//!
//! This crate provides the foundational types shared by the agent manager,
//! provider adapters, session store and chat front end: configuration
//! records, session items, the tool and provider abstractions, and the
//! runner that executes a built agent.

pub mod agent;
pub mod definition;
pub mod error;
pub mod events;
pub mod message;
pub mod provider;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::{
    adapt_model_settings, handoff_tool_name, RunEvent, RunResult, RunStream, Runner, RuntimeAgent,
};
pub use definition::{
    AgentConfig, AgentConfigInput, AgentConfigUpdate, AgentToolConfig, FunctionToolConfig,
    GuardrailConfig, HostedToolConfig, McpServerConfig, ModelConfig, ModelSettings,
    ProviderModel, ProviderSettingsEntry, ProviderType, ToolConfig,
};
pub use error::Error;
pub use events::{AppEvent, EventBus};
pub use message::{
    items_to_messages, AgentInputItem, Content, ContentPart, ItemStatus, Message, Role,
    StreamChunk, ToolCall, Usage,
};
pub use provider::{
    CompletionRequest, CompletionResponse, FinishReason, ModelHandle, Provider, ProviderAdapter,
    StreamResult,
};
pub use tool::{
    canonical_schema, FnExecutor, FunctionToolRegistry, HostedTool, HostedToolRegistry,
    ParameterSchema, PropertySchema, Tool, ToolContext, ToolDefinition, ToolExecutor, ToolOutput,
    ToolParameters,
};

pub type Result<T> = std::result::Result<T, Error>;
