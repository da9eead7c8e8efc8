//! Registry of configured providers with lazy initialization.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use av_core::{AppEvent, Error, EventBus, ModelHandle, ProviderAdapter, ProviderSettingsEntry};

use crate::adapter::create_adapter;

/// Key under which a model is selected: `"<provider>:<model>"`.
pub fn model_key(provider_id: &str, model_id: &str) -> String {
    format!("{}:{}", provider_id, model_id)
}

/// Split a model key at the first `:`. Model ids may themselves contain
/// colons (`llama3:8b`).
pub fn split_model_key(key: &str) -> Option<(&str, &str)> {
    let (provider, model) = key.split_once(':')?;
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider, model))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelOption {
    pub key: String,
    pub display_name: String,
    pub model_id: String,
}

/// Models offered by one usable provider, for the model picker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelGroup {
    pub provider_id: String,
    pub provider_name: String,
    pub models: Vec<ModelOption>,
}

struct Registered {
    entry: ProviderSettingsEntry,
    adapter: Arc<dyn ProviderAdapter>,
}

pub struct ProviderManager {
    providers: RwLock<HashMap<String, Registered>>,
    // Settings order, for stable listings
    order: RwLock<Vec<String>>,
    events: Option<EventBus>,
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderManager {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self, event: AppEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Construct and register the adapter for `entry`. The provider is
    /// registered whether or not it is enabled; enabled providers are
    /// initialized immediately and an initialization failure is returned.
    pub async fn add_provider(&self, entry: ProviderSettingsEntry) -> Result<(), Error> {
        let adapter = create_adapter(&entry)?;
        self.register_adapter(entry, adapter).await
    }

    /// Register a prebuilt adapter under `entry.id`.
    pub async fn register_adapter(
        &self,
        entry: ProviderSettingsEntry,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Result<(), Error> {
        let id = entry.id.clone();
        let enabled = entry.enabled;
        {
            let mut providers = self.providers.write().await;
            let mut order = self.order.write().await;
            if providers
                .insert(id.clone(), Registered { entry, adapter: adapter.clone() })
                .is_none()
            {
                order.push(id.clone());
            }
        }
        debug!(provider = %id, enabled, "Provider registered");

        if enabled {
            adapter.initialize().await?;
            self.publish(AppEvent::ModelsUpdated {
                provider_id: Some(id),
            });
        }
        Ok(())
    }

    /// Replace every provider. A provider that fails to add is logged and
    /// skipped; the rest are still added. Returns how many were added cleanly.
    pub async fn reset_providers(&self, entries: Vec<ProviderSettingsEntry>) -> usize {
        self.providers.write().await.clear();
        self.order.write().await.clear();

        let total = entries.len();
        let mut added = 0;
        for entry in entries {
            let id = entry.id.clone();
            match self.add_provider(entry).await {
                Ok(()) => added += 1,
                Err(e) => warn!(provider = %id, error = %e, "Failed to add provider"),
            }
        }

        info!(added, total, "Providers reset");
        self.publish(AppEvent::ProvidersUpdated);
        added
    }

    pub async fn has_provider(&self, provider_id: &str) -> bool {
        self.providers.read().await.contains_key(provider_id)
    }

    pub async fn provider_ids(&self) -> Vec<String> {
        self.order.read().await.clone()
    }

    /// Look up a provider, initializing it on first use.
    pub async fn ensure_initialized(
        &self,
        provider_id: &str,
    ) -> Result<Arc<dyn ProviderAdapter>, Error> {
        let adapter = self
            .providers
            .read()
            .await
            .get(provider_id)
            .map(|r| r.adapter.clone())
            .ok_or_else(|| Error::ProviderNotFound(provider_id.to_string()))?;

        if !adapter.is_initialized() {
            debug!(provider = %provider_id, "Initializing provider on first use");
            adapter.initialize().await?;
            self.publish(AppEvent::ModelsUpdated {
                provider_id: Some(provider_id.to_string()),
            });
        }
        Ok(adapter)
    }

    pub async fn get_model(&self, provider_id: &str, model_id: &str) -> Result<ModelHandle, Error> {
        self.ensure_initialized(provider_id).await?.model(model_id)
    }

    pub async fn get_available_models(&self, provider_id: &str) -> Result<Vec<String>, Error> {
        Ok(self.ensure_initialized(provider_id).await?.available_models())
    }

    /// Configured models of every runtime-enabled provider, in settings order.
    pub async fn available_model_groups(&self) -> Vec<ModelGroup> {
        let providers = self.providers.read().await;
        let order = self.order.read().await;

        order
            .iter()
            .filter_map(|id| providers.get(id))
            .filter(|r| r.entry.is_runtime_enabled())
            .map(|r| ModelGroup {
                provider_id: r.entry.id.clone(),
                provider_name: r.entry.name.clone(),
                models: r
                    .entry
                    .models
                    .iter()
                    .map(|m| ModelOption {
                        key: model_key(&r.entry.id, &m.model_id),
                        display_name: m.display_name.clone(),
                        model_id: m.model_id.clone(),
                    })
                    .collect(),
            })
            .filter(|g| !g.models.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av_core::testing::{MockProvider, StaticAdapter};
    use av_core::{ProviderModel, ProviderType};

    fn entry(id: &str, enabled: bool) -> ProviderSettingsEntry {
        ProviderSettingsEntry {
            id: id.into(),
            name: id.to_uppercase(),
            provider_type: ProviderType::OpenAI,
            api_key: Some("sk-test".into()),
            api_key_env: None,
            base_url: None,
            enabled,
            models: vec![ProviderModel::new("GPT-5", "gpt-5"), ProviderModel::new("Mini", "gpt-5-mini")],
        }
    }

    fn static_adapter(id: &str) -> Arc<dyn ProviderAdapter> {
        Arc::new(StaticAdapter::new(id, Arc::new(MockProvider::new()), vec!["m".into()]))
    }

    #[test]
    fn test_split_model_key() {
        assert_eq!(split_model_key("openai:gpt-5"), Some(("openai", "gpt-5")));
        assert_eq!(split_model_key("local:llama3:8b"), Some(("local", "llama3:8b")));
        assert_eq!(split_model_key("nokey"), None);
        assert_eq!(split_model_key(":gpt"), None);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_not_found() {
        let manager = ProviderManager::new();
        let err = manager.get_model("missing", "gpt-5").await.unwrap_err();
        assert!(matches!(err, Error::ProviderNotFound(_)));
    }

    #[tokio::test]
    async fn test_disabled_provider_initializes_lazily() {
        let manager = ProviderManager::new();
        let adapter = static_adapter("lazy");
        manager.register_adapter(entry("lazy", false), adapter.clone()).await.unwrap();
        assert!(!adapter.is_initialized());

        let model = manager.get_model("lazy", "m").await.unwrap();
        assert_eq!(model.model_id(), "m");
        assert!(adapter.is_initialized());
    }

    #[tokio::test]
    async fn test_enabled_provider_initializes_eagerly() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let manager = ProviderManager::new().with_events(bus);
        let adapter = static_adapter("eager");
        manager.register_adapter(entry("eager", true), adapter.clone()).await.unwrap();

        assert!(adapter.is_initialized());
        assert_eq!(
            rx.try_recv().unwrap(),
            AppEvent::ModelsUpdated {
                provider_id: Some("eager".into())
            }
        );
    }

    #[tokio::test]
    async fn test_reset_is_partial_success() {
        let manager = ProviderManager::new();
        manager.register_adapter(entry("old", false), static_adapter("old")).await.unwrap();

        let mut unsupported = entry("bad", true);
        unsupported.provider_type = ProviderType::Unsupported("Bedrock".into());
        let mut keyless = entry("keyless", true);
        keyless.api_key = None;

        let added = manager
            .reset_providers(vec![entry("good", false), unsupported, keyless])
            .await;

        assert_eq!(added, 1);
        assert!(!manager.has_provider("old").await);
        assert!(!manager.has_provider("bad").await);
        // Registered even though initialization failed
        assert!(manager.has_provider("keyless").await);
        assert_eq!(manager.provider_ids().await, vec!["good", "keyless"]);
    }

    #[tokio::test]
    async fn test_model_groups_only_runtime_enabled() {
        let manager = ProviderManager::new();
        manager.register_adapter(entry("on", true), static_adapter("on")).await.unwrap();
        manager.register_adapter(entry("off", false), static_adapter("off")).await.unwrap();

        let groups = manager.available_model_groups().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].provider_id, "on");
        assert_eq!(groups[0].models[1].key, "on:gpt-5-mini");
    }
}
