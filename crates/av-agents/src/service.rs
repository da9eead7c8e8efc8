//! Resolve stored agent configurations into runnable agents.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use av_core::{
    adapt_model_settings, AgentConfig, Error, FunctionToolRegistry, HostedToolRegistry,
    RuntimeAgent,
};
use av_providers::ProviderManager;

use crate::manager::AgentManager;
use crate::tool_conversion::{build_tools, OutputExtractor};

pub struct AgentService {
    agents: Arc<AgentManager>,
    providers: Arc<ProviderManager>,
    hosted: Arc<HostedToolRegistry>,
    extractor: Option<OutputExtractor>,
}

impl AgentService {
    pub fn new(
        agents: Arc<AgentManager>,
        providers: Arc<ProviderManager>,
        hosted: Arc<HostedToolRegistry>,
    ) -> Self {
        Self {
            agents,
            providers,
            hosted,
            extractor: None,
        }
    }

    /// Replace the default extractor used by agent tools.
    pub fn with_output_extractor(mut self, extractor: OutputExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub fn providers(&self) -> &Arc<ProviderManager> {
        &self.providers
    }

    pub fn functions(&self) -> &FunctionToolRegistry {
        self.agents.functions()
    }

    pub fn hosted(&self) -> &HostedToolRegistry {
        &self.hosted
    }

    pub(crate) fn output_extractor(&self) -> Option<OutputExtractor> {
        self.extractor.clone()
    }

    /// Build `config` against an explicit provider/model, falling back to the
    /// agent's own model config for whichever is not given.
    ///
    /// Returns `None` when the agent cannot be built; the cause is logged.
    pub async fn build(
        &self,
        config: &AgentConfig,
        provider_id: Option<&str>,
        model_id: Option<&str>,
    ) -> Option<Arc<RuntimeAgent>> {
        let provider_id = provider_id.unwrap_or(&config.model_config.provider);
        let model_id = model_id.unwrap_or(&config.model_config.model);

        match self.assemble(config, provider_id, model_id, &[]).await {
            Ok(agent) => Some(agent),
            Err(e) => {
                warn!(
                    agent = %config.id,
                    provider = %provider_id,
                    model = %model_id,
                    error = %e,
                    "Agent unavailable"
                );
                None
            }
        }
    }

    /// Build a stored agent and its handoff graph. `seen` holds the ids of
    /// the agents above this one; meeting one of them again is a
    /// [`Error::CircularHandoff`].
    pub async fn build_agent(&self, id: &str, seen: &[String]) -> Result<Arc<RuntimeAgent>, Error> {
        let config = self
            .agents
            .get_agent(id)
            .ok_or_else(|| Error::not_found("agent", id))?;
        self.assemble(
            &config,
            &config.model_config.provider,
            &config.model_config.model,
            seen,
        )
        .await
    }

    fn assemble<'a>(
        &'a self,
        config: &'a AgentConfig,
        provider_id: &'a str,
        model_id: &'a str,
        path: &'a [String],
    ) -> BoxFuture<'a, Result<Arc<RuntimeAgent>, Error>> {
        Box::pin(async move {
            if path.contains(&config.id) {
                let mut cycle = path.to_vec();
                cycle.push(config.id.clone());
                return Err(Error::circular_handoff(cycle));
            }

            // Each branch gets its own copy so siblings never see each other
            let mut own_path = path.to_vec();
            own_path.push(config.id.clone());

            let mut handoffs = Vec::with_capacity(config.handoff_ids.len());
            for target in &config.handoff_ids {
                match self.build_agent(target, &own_path).await {
                    Ok(agent) => handoffs.push(agent),
                    Err(e @ Error::CircularHandoff { .. }) => return Err(e),
                    Err(e) => {
                        warn!(agent = %config.id, handoff = %target, error = %e, "Skipping unresolved handoff");
                    }
                }
            }

            let model = self.providers.get_model(provider_id, model_id).await?;

            let built = build_tools(config, self, &own_path).await;
            for diagnostic in &built.diagnostics {
                warn!(
                    agent = %config.id,
                    tool = %diagnostic.tool_name,
                    "Tool skipped: {}",
                    diagnostic.message
                );
            }

            debug!(
                agent = %config.id,
                provider = %provider_id,
                model = %model_id,
                tools = built.tools.len(),
                hosted_tools = built.hosted.len(),
                handoffs = handoffs.len(),
                "Agent built"
            );

            let agent = RuntimeAgent::new(&config.id, &config.name, &config.instructions, model)
                .with_model_settings(adapt_model_settings(config.model_config.settings.as_ref()))
                .with_tools(built.tools)
                .with_hosted_tools(built.hosted)
                .with_handoffs(handoffs)
                .with_output_type(config.output_type.clone());
            Ok(Arc::new(agent))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av_core::testing::{EchoExecutor, MockProvider, StaticAdapter};
    use av_core::{
        AgentConfigInput, AgentConfigUpdate, AgentToolConfig, FunctionToolConfig, ModelConfig,
        ProviderSettingsEntry, ProviderType, ToolConfig, ToolContext,
    };
    use av_store::MemoryAgentRepository;
    use serde_json::{json, Value};

    use crate::tool_conversion::DiagnosticLevel;

    async fn setup() -> (AgentService, Arc<MockProvider>) {
        let functions = FunctionToolRegistry::new().with("echo", Arc::new(EchoExecutor));
        let agents = Arc::new(AgentManager::new(
            Arc::new(MemoryAgentRepository::new()),
            Arc::new(functions),
        ));

        let provider = Arc::new(MockProvider::new());
        let providers = Arc::new(ProviderManager::new());
        let entry = ProviderSettingsEntry {
            id: "openai-default".into(),
            name: "OpenAI".into(),
            provider_type: ProviderType::OpenAI,
            api_key: None,
            api_key_env: None,
            base_url: None,
            enabled: false,
            models: Vec::new(),
        };
        let adapter = StaticAdapter::new("openai-default", provider.clone(), vec!["gpt-5".into()]);
        providers.register_adapter(entry, Arc::new(adapter)).await.unwrap();

        let service = AgentService::new(agents, providers, Arc::new(HostedToolRegistry::with_defaults()));
        (service, provider)
    }

    fn input(name: &str) -> AgentConfigInput {
        AgentConfigInput::new(name, format!("You are {}", name), ModelConfig::new("openai-default", "gpt-5"))
    }

    async fn create(service: &AgentService, input: AgentConfigInput) -> AgentConfig {
        service.agents().create_agent(input).await.unwrap()
    }

    #[tokio::test]
    async fn test_build_uses_stored_model_selection() {
        let (service, _) = setup().await;
        let config = create(&service, input("writer")).await;

        let agent = service.build(&config, None, None).await.unwrap();
        assert_eq!(agent.name, "writer");
        assert_eq!(agent.model.model_id(), "gpt-5");
        assert_eq!(agent.model_settings.tool_choice.as_deref(), Some("auto"));

        let agent = service.build(&config, None, Some("gpt-5-mini")).await.unwrap();
        assert_eq!(agent.model.model_id(), "gpt-5-mini");
    }

    #[tokio::test]
    async fn test_build_returns_none_for_unknown_provider() {
        let (service, _) = setup().await;
        let config = create(&service, input("writer")).await;
        assert!(service.build(&config, Some("nowhere"), None).await.is_none());
    }

    #[tokio::test]
    async fn test_diamond_handoffs_build() {
        let (service, _) = setup().await;
        let d = create(&service, input("d")).await;
        let b = create(&service, input("b").with_handoff(&d.id)).await;
        let c = create(&service, input("c").with_handoff(&d.id)).await;
        let a = create(&service, input("a").with_handoff(&b.id).with_handoff(&c.id)).await;

        let agent = service.build(&a, None, None).await.unwrap();
        let names: Vec<&str> = agent.handoffs.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(agent.handoffs[0].handoffs[0].name, "d");
        assert_eq!(agent.handoffs[1].handoffs[0].name, "d");
    }

    #[tokio::test]
    async fn test_circular_handoff_is_rejected() {
        let (service, _) = setup().await;
        let a = create(&service, input("a")).await;
        let b = create(&service, input("b").with_handoff(&a.id)).await;
        let update = AgentConfigUpdate {
            handoff_ids: Some(vec![b.id.clone()]),
            ..Default::default()
        };
        service.agents().update_agent(&a.id, update).await.unwrap();

        let err = service.build_agent(&a.id, &[]).await.err().unwrap();
        match err {
            Error::CircularHandoff { path } => {
                assert_eq!(path, vec![a.id.clone(), b.id.clone(), a.id.clone()])
            }
            other => panic!("expected circular handoff, got {other:?}"),
        }

        let a = service.agents().get_agent(&a.id).unwrap();
        assert!(service.build(&a, None, None).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_handoff_is_skipped() {
        let (service, _) = setup().await;
        let b = create(&service, input("b")).await;
        let a = create(&service, input("a").with_handoff(&b.id)).await;
        service.agents().delete_agent(&b.id).await.unwrap();

        let agent = service.build(&a, None, None).await.unwrap();
        assert!(agent.handoffs.is_empty());
    }

    #[tokio::test]
    async fn test_tools_skip_disabled_and_report_unbuildable() {
        let (service, _) = setup().await;
        let mut disabled = FunctionToolConfig::new("quiet");
        disabled.executor = Some("echo".into());
        disabled.enabled = false;

        let config = create(
            &service,
            input("tools")
                .with_tool(ToolConfig::Function(FunctionToolConfig::new("echo")))
                .with_tool(ToolConfig::Function(FunctionToolConfig::new("unregistered")))
                .with_tool(ToolConfig::Function(disabled)),
        )
        .await;

        let built = build_tools(&config, &service, &[config.id.clone()]).await;
        assert_eq!(built.tool_names(), vec!["echo"]);
        assert_eq!(built.diagnostics.len(), 1);
        assert_eq!(built.diagnostics[0].level, DiagnosticLevel::Warn);
        assert_eq!(built.diagnostics[0].tool_name, "unregistered");

        // Strict mode closes the executor's schema
        let params = built.tools[0].definition().parameters;
        assert_eq!(params["additionalProperties"], json!(false));
        assert_eq!(params["required"], json!(["text"]));
    }

    #[tokio::test]
    async fn test_hosted_tools_follow_factories() {
        let (service, _) = setup().await;
        let hosted = |name: &str, data| {
            ToolConfig::Hosted(av_core::HostedToolConfig {
                name: name.into(),
                provider_data: data,
                enabled: true,
            })
        };
        let config = create(
            &service,
            input("search")
                .with_tool(hosted("web_search", json!({})))
                .with_tool(hosted("file_search", json!({})))
                .with_tool(hosted("teleport", json!({}))),
        )
        .await;

        let built = build_tools(&config, &service, &[]).await;
        assert_eq!(built.hosted.len(), 1);
        assert_eq!(built.hosted[0].kind, "web_search");
        // file_search declined without a diagnostic; the unknown one is reported
        assert_eq!(built.diagnostics.len(), 1);
        assert_eq!(built.diagnostics[0].tool_name, "teleport");
    }

    #[tokio::test]
    async fn test_agent_tool_runs_sub_agent() {
        let (service, provider) = setup().await;
        let helper = create(&service, input("helper")).await;
        let main = create(
            &service,
            input("main").with_tool(ToolConfig::Agent(AgentToolConfig {
                name: "ask_helper".into(),
                description: String::new(),
                target_agent_id: helper.id.clone(),
                enabled: true,
            })),
        )
        .await;

        let agent = service.build(&main, None, None).await.unwrap();
        let tool = agent.tool("ask_helper").unwrap();
        assert_eq!(tool.description(), "Ask the helper agent.");

        provider.queue_response("helper says hi");
        let output = tool
            .execute(json!({"input": "hello"}), &ToolContext::new("main"))
            .await
            .unwrap();
        assert_eq!(output.content, "helper says hi");
        assert!(!output.is_error);
    }

    #[tokio::test]
    async fn test_custom_output_extractor() {
        let (service, provider) = setup().await;
        let service = service.with_output_extractor(Arc::new(|v: &Value| format!("<{}>", v)));
        let helper = create(&service, input("helper")).await;
        let main = create(
            &service,
            input("main").with_tool(ToolConfig::Agent(AgentToolConfig {
                name: "ask_helper".into(),
                description: "Delegate".into(),
                target_agent_id: helper.id,
                enabled: true,
            })),
        )
        .await;

        let agent = service.build(&main, None, None).await.unwrap();
        provider.queue_response("ok");
        let output = agent
            .tool("ask_helper")
            .unwrap()
            .execute(json!({"input": "x"}), &ToolContext::new("main"))
            .await
            .unwrap();
        assert_eq!(output.content, "<\"ok\">");
    }
}
