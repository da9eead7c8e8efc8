//! Dependency wiring for the binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use av_agents::{AgentManager, AgentService};
use av_core::{EventBus, HostedToolRegistry};
use av_providers::ProviderManager;
use av_session::SessionManager;
use av_store::SqliteStore;

use crate::chat_store::ChatStore;
use crate::config::Settings;
use crate::executors::builtin_executors;

/// Every long-lived component, built once at startup.
pub struct App {
    pub events: EventBus,
    pub agents: Arc<AgentManager>,
    pub providers: Arc<ProviderManager>,
    pub service: Arc<AgentService>,
    pub sessions: Arc<SessionManager>,
}

impl App {
    /// Open the configured database and wire everything over it.
    pub async fn open(settings: &Settings) -> Result<Self> {
        let db_path = settings.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {}", db_path.display()))?,
        );
        Ok(Self::with_store(settings, store).await)
    }

    pub async fn with_store(settings: &Settings, store: Arc<SqliteStore>) -> Self {
        let events = EventBus::default();

        let functions = Arc::new(builtin_executors(settings.notes_root()));
        let agents = Arc::new(AgentManager::new(store.clone(), functions).with_events(events.clone()));
        let loaded = agents.load_agents_from_database().await;

        let providers = Arc::new(ProviderManager::new().with_events(events.clone()));
        let registered = providers.reset_providers(settings.providers.clone()).await;

        let service = Arc::new(AgentService::new(
            agents.clone(),
            providers.clone(),
            Arc::new(HostedToolRegistry::with_defaults()),
        ));
        let sessions = Arc::new(
            SessionManager::new(store, settings.session).with_events(events.clone()),
        );

        info!(agents = loaded, providers = registered, "Application ready");
        Self {
            events,
            agents,
            providers,
            service,
            sessions,
        }
    }

    /// Chat store following application events, with the configured defaults.
    pub async fn chat_store(&self, settings: &Settings) -> Arc<ChatStore> {
        let store = Arc::new(
            ChatStore::new(self.service.clone(), self.sessions.clone()).with_defaults(
                settings.default_agent_id.clone(),
                settings.default_model_key.clone(),
            ),
        );
        store.refresh().await;
        store.watch_events(&self.events);
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av_core::{AgentConfigInput, ModelConfig};

    #[tokio::test]
    async fn test_wiring_over_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            database_path: dir.path().join("nested").join("vault.db").display().to_string(),
            ..Settings::default()
        };

        let app = App::open(&settings).await.unwrap();
        let created = app
            .agents
            .create_agent(AgentConfigInput::new(
                "Scribe",
                "Take notes.",
                ModelConfig::new("openai-default", "gpt-5"),
            ))
            .await
            .unwrap();
        assert!(app.service.functions().get("read_note").is_some());

        // Default provider is disabled, so there is nothing to pick from
        let store = app.chat_store(&settings).await;
        let state = store.snapshot();
        assert_eq!(state.selected_agent_id.as_deref(), Some(created.id.as_str()));
        assert!(state.model_groups.is_empty());
        assert!(app.providers.available_model_groups().await.is_empty());
        assert!(!state.can_send);

        let reopened = App::open(&settings).await.unwrap();
        assert!(reopened.agents.has_agent(&created.id));
    }
}
