use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// Canonical JSON schema for the arguments object.
    pub parameters: Value,
    #[serde(default)]
    pub strict: bool,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: canonical_schema(None, true),
            strict: true,
        }
    }

    pub fn with_parameters(mut self, parameters: &ParameterSchema) -> Self {
        self.parameters = canonical_schema(Some(parameters), self.strict);
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

// =============================================================================
// Parameter schemas
// =============================================================================

/// Tool argument schema as supplied by a caller.
///
/// Either a hand-written JSON schema or one assembled with
/// [`ToolParameters`]. Both are resolved once, through [`canonical_schema`],
/// into the JSON value sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSchema {
    Json(Value),
    Typed(ToolParameters),
}

impl ParameterSchema {
    pub fn to_value(&self) -> Value {
        match self {
            ParameterSchema::Typed(params) => serde_json::to_value(params).unwrap_or(Value::Null),
            ParameterSchema::Json(value) => value.clone(),
        }
    }
}

impl From<ToolParameters> for ParameterSchema {
    fn from(params: ToolParameters) -> Self {
        ParameterSchema::Typed(params)
    }
}

impl From<Value> for ParameterSchema {
    fn from(value: Value) -> Self {
        ParameterSchema::Json(value)
    }
}

/// Resolve a schema into its canonical form.
///
/// Strict mode closes the object (`additionalProperties: false`) and lists
/// every declared property as required. Non-strict mode leaves `required`
/// alone and opens the object. A missing or non-object schema becomes an
/// empty closed object (strict) or an open object (non-strict).
pub fn canonical_schema(schema: Option<&ParameterSchema>, strict: bool) -> Value {
    let value = schema.map(ParameterSchema::to_value);

    match value {
        Some(Value::Object(mut map)) if map.get("type").and_then(Value::as_str) == Some("object") => {
            if strict {
                if !map.get("properties").is_some_and(Value::is_object) {
                    map.insert("properties".to_string(), Value::Object(Map::new()));
                }
                let required: Vec<Value> = map["properties"]
                    .as_object()
                    .map(|props| props.keys().cloned().map(Value::String).collect())
                    .unwrap_or_default();
                map.insert("required".to_string(), Value::Array(required));
                map.insert("additionalProperties".to_string(), Value::Bool(false));
            } else {
                map.insert("additionalProperties".to_string(), Value::Bool(true));
            }
            Value::Object(map)
        }
        _ if strict => json!({
            "type": "object",
            "properties": {},
            "required": [],
            "additionalProperties": false
        }),
        _ => json!({
            "type": "object",
            "properties": {},
            "additionalProperties": true
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: std::collections::BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", default)]
    pub additional_properties: bool,
}

impl Default for ToolParameters {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: std::collections::BTreeMap::new(),
            required: Vec::new(),
            additional_properties: false,
        }
    }
}

impl ToolParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(
        mut self,
        name: impl Into<String>,
        schema: PropertySchema,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), schema);
        if required {
            self.required.push(name);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    fn typed(schema_type: &str, description: impl Into<String>) -> Self {
        Self {
            schema_type: schema_type.to_string(),
            description: Some(description.into()),
            enum_values: None,
            items: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::typed("string", description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::typed("integer", description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::typed("boolean", description)
    }

    pub fn array(description: impl Into<String>, items: PropertySchema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::typed("array", description)
        }
    }

    pub fn enum_string(description: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            enum_values: Some(values),
            ..Self::typed("string", description)
        }
    }
}

// =============================================================================
// Runtime tools
// =============================================================================

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Per-call information handed to tools and executors.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub agent_name: String,
    pub session_id: Option<String>,
}

impl ToolContext {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// A locally executed tool, as handed to the runner.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolOutput, Error>;
}

/// A registered callable backing function tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call(&self, arguments: Value, ctx: &ToolContext) -> Result<Value, Error>;

    /// Schema used when a function tool config does not declare one.
    fn parameters(&self) -> Option<ParameterSchema> {
        None
    }
}

type ExecutorFn = dyn Fn(Value, ToolContext) -> futures::future::BoxFuture<'static, Result<Value, Error>>
    + Send
    + Sync;

/// Adapts an async closure into a [`ToolExecutor`].
pub struct FnExecutor {
    f: Box<ExecutorFn>,
    parameters: Option<ParameterSchema>,
}

impl FnExecutor {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, Error>> + Send + 'static,
    {
        Self {
            f: Box::new(move |args, ctx| Box::pin(f(args, ctx))),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: impl Into<ParameterSchema>) -> Self {
        self.parameters = Some(parameters.into());
        self
    }
}

#[async_trait]
impl ToolExecutor for FnExecutor {
    async fn call(&self, arguments: Value, ctx: &ToolContext) -> Result<Value, Error> {
        (self.f)(arguments, ctx.clone()).await
    }

    fn parameters(&self) -> Option<ParameterSchema> {
        self.parameters.clone()
    }
}

/// Lookup table from executor name to callable.
///
/// Constructed by whoever wires the application together and shared by
/// reference; there is no process-wide instance.
#[derive(Default, Clone)]
pub struct FunctionToolRegistry {
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl FunctionToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn ToolExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    pub fn with(mut self, name: impl Into<String>, executor: Arc<dyn ToolExecutor>) -> Self {
        self.register(name, executor);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }
}

// =============================================================================
// Hosted tools
// =============================================================================

/// A capability executed by the model backend rather than locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedTool {
    /// Backend tool type, e.g. `web_search`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl HostedTool {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

pub type HostedToolFactory = Arc<dyn Fn(&Value) -> Option<HostedTool> + Send + Sync>;

/// Maps fixed hosted tool names to factories.
#[derive(Default, Clone)]
pub struct HostedToolRegistry {
    factories: HashMap<String, HostedToolFactory>,
}

impl HostedToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the capabilities common OpenAI-style backends provide.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("web_search", Arc::new(|_: &Value| Some(HostedTool::new("web_search"))));
        registry.register("code_interpreter", Arc::new(|_: &Value| {
            Some(HostedTool::new("code_interpreter").with_option("container", json!({"type": "auto"})))
        }));
        registry.register("image_generation", Arc::new(|_: &Value| Some(HostedTool::new("image_generation"))));
        registry.register("file_search", Arc::new(file_search_factory));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: HostedToolFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build a hosted tool. `Ok(None)` means the factory declined the
    /// provider data; `Err` means the name is not a known capability.
    pub fn build(&self, name: &str, provider_data: &Value) -> Result<Option<HostedTool>, Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::tool(name, "unknown hosted tool"))?;
        Ok(factory(provider_data))
    }
}

fn file_search_factory(provider_data: &Value) -> Option<HostedTool> {
    let ids: Option<Vec<Value>> = provider_data
        .get("vector_store_ids")
        .and_then(Value::as_array)
        .filter(|ids| !ids.is_empty() && ids.iter().all(|id| id.as_str().is_some_and(|s| !s.is_empty())))
        .cloned();

    match ids {
        Some(ids) => Some(HostedTool::new("file_search").with_option("vector_store_ids", Value::Array(ids))),
        None => {
            warn!("file_search requires a non-empty vector_store_ids string array; tool dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definition() {
        let params = ToolParameters::new()
            .add_property("path", PropertySchema::string("Path to the note"), true);
        let def = ToolDefinition::new("read_note", "Read a note").with_parameters(&params.into());

        assert_eq!(def.name, "read_note");
        assert_eq!(def.parameters["required"], json!(["path"]));
        assert_eq!(def.parameters["additionalProperties"], json!(false));
    }

    #[test]
    fn test_strict_schema_closes_object_and_requires_all() {
        let schema = ParameterSchema::Json(json!({
            "type": "object",
            "properties": {"a": {"type": "string"}, "b": {"type": "integer"}},
            "required": ["a"],
            "additionalProperties": true
        }));

        let strict = canonical_schema(Some(&schema), true);
        assert_eq!(strict["additionalProperties"], json!(false));
        assert_eq!(strict["required"], json!(["a", "b"]));

        let open = canonical_schema(Some(&schema), false);
        assert_eq!(open["additionalProperties"], json!(true));
        assert_eq!(open["required"], json!(["a"]));
    }

    #[test]
    fn test_invalid_schema_fallbacks() {
        let bogus = ParameterSchema::Json(json!("not a schema"));
        let strict = canonical_schema(Some(&bogus), true);
        assert_eq!(strict["properties"], json!({}));
        assert_eq!(strict["additionalProperties"], json!(false));

        let open = canonical_schema(None, false);
        assert_eq!(open["additionalProperties"], json!(true));
        assert!(open.get("required").is_none());
    }

    #[test]
    fn test_tool_output() {
        assert!(!ToolOutput::success("done").is_error);
        assert!(ToolOutput::error("failed").is_error);
    }

    #[tokio::test]
    async fn test_function_registry_lookup() {
        let registry = FunctionToolRegistry::new().with(
            "upper",
            Arc::new(FnExecutor::new(|args: Value, _ctx| async move {
                Ok(Value::String(args["text"].as_str().unwrap_or_default().to_uppercase()))
            })),
        );

        assert!(registry.contains("upper"));
        assert!(!registry.contains("lower"));
        let out = registry
            .get("upper")
            .unwrap()
            .call(json!({"text": "hi"}), &ToolContext::new("test"))
            .await
            .unwrap();
        assert_eq!(out, json!("HI"));
    }

    #[test]
    fn test_file_search_requires_vector_stores() {
        let registry = HostedToolRegistry::with_defaults();

        let missing = registry.build("file_search", &json!({})).unwrap();
        assert!(missing.is_none());

        let malformed = registry
            .build("file_search", &json!({"vector_store_ids": [1, 2]}))
            .unwrap();
        assert!(malformed.is_none());

        let ok = registry
            .build("file_search", &json!({"vector_store_ids": ["vs_1"]}))
            .unwrap()
            .unwrap();
        assert_eq!(ok.kind, "file_search");
        assert_eq!(ok.options["vector_store_ids"], json!(["vs_1"]));

        assert!(registry.build("teleport", &json!({})).is_err());
    }
}
