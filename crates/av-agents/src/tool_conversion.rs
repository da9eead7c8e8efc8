//! Materialize an agent's declared tools into runtime tools.
//!
//! A tool that cannot be built is reported as a [`Diagnostic`] and left out;
//! the rest of the batch is still returned.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use av_core::{
    canonical_schema, AgentConfig, AgentInputItem, AgentToolConfig, Error, FunctionToolConfig,
    HostedTool, HostedToolConfig, PropertySchema, Runner, RuntimeAgent, Tool, ToolConfig,
    ToolContext, ToolDefinition, ToolExecutor, ToolOutput, ToolParameters,
};

use crate::service::AgentService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Warn,
    Error,
}

/// A non-fatal problem found while building one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub tool_name: String,
    pub message: String,
}

impl Diagnostic {
    fn warn(tool_name: &str, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warn,
            tool_name: tool_name.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Default)]
pub struct ToolBuildOutput {
    /// Locally executed tools, in declaration order.
    pub tools: Vec<Arc<dyn Tool>>,
    /// Backend-executed tools, in declaration order.
    pub hosted: Vec<HostedTool>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ToolBuildOutput {
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
}

/// Turns a sub-agent's run output into the tool result text.
pub type OutputExtractor = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Strings pass through; objects yield their `finalOutput` string; anything
/// else is empty.
pub fn default_output_extractor(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other
            .get("finalOutput")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Build every enabled tool of `config`. `path` is the chain of agent ids
/// currently being built, used to stop agent tools from recursing into an
/// ancestor.
pub async fn build_tools(
    config: &AgentConfig,
    service: &AgentService,
    path: &[String],
) -> ToolBuildOutput {
    let mut out = ToolBuildOutput::default();

    for tool in config.tools.iter().filter(|t| t.is_enabled()) {
        match tool {
            ToolConfig::Function(f) => match build_function_tool(f, service) {
                Ok(built) => out.tools.push(built),
                Err(e) => out.diagnostics.push(Diagnostic::warn(&f.name, e.to_string())),
            },
            ToolConfig::Hosted(h) => match build_hosted_tool(h, service) {
                Ok(Some(built)) => out.hosted.push(built),
                // Declined by the factory, which already logged why
                Ok(None) => {}
                Err(e) => out.diagnostics.push(Diagnostic::warn(&h.name, e.to_string())),
            },
            ToolConfig::Agent(a) => match build_agent_tool(a, service, path).await {
                Ok(built) => out.tools.push(built),
                Err(e) => out.diagnostics.push(Diagnostic::warn(&a.name, e.to_string())),
            },
        }
    }

    out
}

fn build_function_tool(
    config: &FunctionToolConfig,
    service: &AgentService,
) -> Result<Arc<dyn Tool>, Error> {
    let executor = service.functions().get(config.executor_name()).ok_or_else(|| {
        Error::tool(
            &config.name,
            format!("executor '{}' is not registered", config.executor_name()),
        )
    })?;

    let fallback = executor.parameters();
    let schema = config.parameters.as_ref().or(fallback.as_ref());

    let mut definition =
        ToolDefinition::new(&config.name, &config.description).with_strict(config.strict);
    definition.parameters = canonical_schema(schema, config.strict);

    Ok(Arc::new(FunctionTool {
        definition,
        executor,
    }))
}

fn build_hosted_tool(
    config: &HostedToolConfig,
    service: &AgentService,
) -> Result<Option<HostedTool>, Error> {
    service.hosted().build(&config.name, &config.provider_data)
}

async fn build_agent_tool(
    config: &AgentToolConfig,
    service: &AgentService,
    path: &[String],
) -> Result<Arc<dyn Tool>, Error> {
    let agent = service.build_agent(&config.target_agent_id, path).await?;

    let description = if config.description.is_empty() {
        format!("Ask the {} agent.", agent.name)
    } else {
        config.description.clone()
    };

    Ok(Arc::new(AgentTool {
        name: config.name.clone(),
        description,
        agent,
        extractor: service
            .output_extractor()
            .unwrap_or_else(|| Arc::new(default_output_extractor) as OutputExtractor),
    }))
}

/// A registered executor exposed to the model.
struct FunctionTool {
    definition: ToolDefinition,
    executor: Arc<dyn ToolExecutor>,
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolOutput, Error> {
        let result = self.executor.call(arguments, ctx).await?;
        Ok(ToolOutput::success(match result {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        }))
    }
}

/// Another agent exposed as a tool. The sub-agent runs on the given input
/// alone, without the caller's history.
struct AgentTool {
    name: String,
    description: String,
    agent: Arc<RuntimeAgent>,
    extractor: OutputExtractor,
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(&self.name, &self.description).with_parameters(
            &ToolParameters::new()
                .add_property("input", PropertySchema::string("The request for the agent"), true)
                .into(),
        )
    }

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolOutput, Error> {
        let input = arguments
            .get("input")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::tool(&self.name, "missing 'input' argument"))?;

        let mut runner = Runner::new();
        if let Some(session) = &ctx.session_id {
            runner = runner.with_session(session.clone());
        }

        match runner
            .run(self.agent.clone(), vec![AgentInputItem::user(input)])
            .await
        {
            Ok(result) => Ok(ToolOutput::success((self.extractor)(&result.final_output))),
            Err(e) => Ok(ToolOutput::error(format!("Agent error: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_output_extractor() {
        assert_eq!(default_output_extractor(&json!("plain")), "plain");
        assert_eq!(default_output_extractor(&json!({"finalOutput": "nested"})), "nested");
        assert_eq!(default_output_extractor(&json!({"finalOutput": 3})), "");
        assert_eq!(default_output_extractor(&json!(42)), "");
    }
}
