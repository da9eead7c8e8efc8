//! Stored configuration records: agents, their tools, and model providers.
//!
//! These are plain data plus validation. Turning a record into something
//! runnable is the job of the agent service.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::tool::ParameterSchema;

pub const MAX_AGENT_NAME_CHARS: usize = 100;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Model selection
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// `auto`, `required`, `none`, or a tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider id, e.g. `openai-default`.
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<ModelSettings>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            settings: None,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.provider.trim().is_empty() {
            return Err(Error::validation("model config: provider must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(Error::validation("model config: model must not be empty"));
        }
        if let Some(t) = self.settings.as_ref().and_then(|s| s.temperature) {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::validation(format!(
                    "model config: temperature {} outside 0.0..=2.0",
                    t
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tools
// =============================================================================

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Registered executor; defaults to the tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ParameterSchema>,
    #[serde(default = "default_true")]
    pub strict: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl FunctionToolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            executor: None,
            parameters: None,
            strict: true,
            enabled: true,
        }
    }

    pub fn executor_name(&self) -> &str {
        self.executor.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedToolConfig {
    /// One of the hosted capability names (`web_search`, `file_search`, ...).
    pub name: String,
    #[serde(default)]
    pub provider_data: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub target_agent_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolConfig {
    Function(FunctionToolConfig),
    Hosted(HostedToolConfig),
    Agent(AgentToolConfig),
}

impl ToolConfig {
    pub fn name(&self) -> &str {
        match self {
            ToolConfig::Function(t) => &t.name,
            ToolConfig::Hosted(t) => &t.name,
            ToolConfig::Agent(t) => &t.name,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            ToolConfig::Function(t) => t.enabled,
            ToolConfig::Hosted(t) => t.enabled,
            ToolConfig::Agent(t) => t.enabled,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ToolConfig::Function(_) => "function",
            ToolConfig::Hosted(_) => "hosted",
            ToolConfig::Agent(_) => "agent",
        }
    }
}

// =============================================================================
// Agents
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub instructions: String,
    pub model_config: ModelConfig,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    /// Agents this one may hand the conversation to, in declared order.
    #[serde(default)]
    pub handoff_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<Value>,
    #[serde(default)]
    pub input_guardrails: Vec<GuardrailConfig>,
    #[serde(default)]
    pub output_guardrails: Vec<GuardrailConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AgentConfig {
    /// Materialize a validated input with a fresh id and matching timestamps.
    pub fn from_input(input: AgentConfigInput) -> Self {
        let now = now_millis();
        Self {
            id: new_id(),
            name: input.name,
            instructions: input.instructions,
            model_config: input.model_config,
            tools: input.tools,
            handoff_ids: input.handoff_ids,
            output_type: input.output_type,
            input_guardrails: input.input_guardrails,
            output_guardrails: input.output_guardrails,
            mcp_servers: input.mcp_servers,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tool(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Advance `updated_at`, never below `created_at`.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.created_at).max(self.updated_at);
    }
}

/// Caller-supplied fields for a new agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfigInput {
    pub name: String,
    pub instructions: String,
    pub model_config: ModelConfig,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub handoff_ids: Vec<String>,
    #[serde(default)]
    pub output_type: Option<Value>,
    #[serde(default)]
    pub input_guardrails: Vec<GuardrailConfig>,
    #[serde(default)]
    pub output_guardrails: Vec<GuardrailConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl AgentConfigInput {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        model_config: ModelConfig,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            model_config,
            tools: Vec::new(),
            handoff_ids: Vec::new(),
            output_type: None,
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
            mcp_servers: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: ToolConfig) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_handoff(mut self, agent_id: impl Into<String>) -> Self {
        self.handoff_ids.push(agent_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_name(&self.name)?;
        validate_instructions(&self.instructions)?;
        self.model_config.validate()?;
        validate_tool_names(&self.tools)
    }
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfigUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model_config: Option<ModelConfig>,
    #[serde(default)]
    pub tools: Option<Vec<ToolConfig>>,
    #[serde(default)]
    pub handoff_ids: Option<Vec<String>>,
    #[serde(default)]
    pub output_type: Option<Option<Value>>,
    #[serde(default)]
    pub input_guardrails: Option<Vec<GuardrailConfig>>,
    #[serde(default)]
    pub output_guardrails: Option<Vec<GuardrailConfig>>,
    #[serde(default)]
    pub mcp_servers: Option<Vec<McpServerConfig>>,
}

impl AgentConfigUpdate {
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(instructions) = &self.instructions {
            validate_instructions(instructions)?;
        }
        if let Some(model_config) = &self.model_config {
            model_config.validate()?;
        }
        if let Some(tools) = &self.tools {
            validate_tool_names(tools)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Merge into `config`. Does not touch timestamps.
    pub fn apply_to(self, config: &mut AgentConfig) {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(instructions) = self.instructions {
            config.instructions = instructions;
        }
        if let Some(model_config) = self.model_config {
            config.model_config = model_config;
        }
        if let Some(tools) = self.tools {
            config.tools = tools;
        }
        if let Some(handoff_ids) = self.handoff_ids {
            config.handoff_ids = handoff_ids;
        }
        if let Some(output_type) = self.output_type {
            config.output_type = output_type;
        }
        if let Some(guardrails) = self.input_guardrails {
            config.input_guardrails = guardrails;
        }
        if let Some(guardrails) = self.output_guardrails {
            config.output_guardrails = guardrails;
        }
        if let Some(servers) = self.mcp_servers {
            config.mcp_servers = servers;
        }
    }
}

fn validate_name(name: &str) -> Result<(), Error> {
    let len = name.trim().chars().count();
    if len == 0 {
        return Err(Error::validation("name must not be empty"));
    }
    if name.chars().count() > MAX_AGENT_NAME_CHARS {
        return Err(Error::validation(format!(
            "name must be at most {} characters",
            MAX_AGENT_NAME_CHARS
        )));
    }
    Ok(())
}

fn validate_instructions(instructions: &str) -> Result<(), Error> {
    if instructions.trim().is_empty() {
        return Err(Error::validation("instructions must not be empty"));
    }
    Ok(())
}

fn validate_tool_names(tools: &[ToolConfig]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for tool in tools {
        if tool.name().trim().is_empty() {
            return Err(Error::validation("tool name must not be empty"));
        }
        if !seen.insert(tool.name()) {
            return Err(Error::validation(format!(
                "duplicate tool name '{}'",
                tool.name()
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Providers
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderType {
    OpenAI,
    OpenAICompatible,
    /// Anything else; rejected when the provider is constructed.
    #[serde(untagged)]
    Unsupported(String),
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::OpenAI => write!(f, "OpenAI"),
            ProviderType::OpenAICompatible => write!(f, "OpenAICompatible"),
            ProviderType::Unsupported(other) => write!(f, "{}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderModel {
    pub display_name: String,
    pub model_id: String,
}

impl ProviderModel {
    pub fn new(display_name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            model_id: model_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettingsEntry {
    pub id: String,
    pub name: String,
    pub provider_type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the key, used when `api_key` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<ProviderModel>,
}

impl ProviderSettingsEntry {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.trim().is_empty())
            })
    }

    /// Enabled and carrying the credentials its type needs.
    pub fn is_runtime_enabled(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let has_key = self.resolved_api_key().is_some();
        match self.provider_type {
            ProviderType::OpenAI => has_key,
            ProviderType::OpenAICompatible => {
                has_key && self.base_url.as_deref().is_some_and(|u| !u.trim().is_empty())
            }
            ProviderType::Unsupported(_) => false,
        }
    }
}
