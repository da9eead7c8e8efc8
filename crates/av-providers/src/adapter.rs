//! Provider adapters: lazy, credential-checked wrappers around the
//! chat-completions transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::debug;

use av_core::{Error, ModelHandle, ProviderAdapter, ProviderSettingsEntry, ProviderType};

use crate::openai::OpenAIProvider;

/// State shared by both adapter flavors.
struct LazyTransport {
    entry: ProviderSettingsEntry,
    transport: OnceCell<Arc<OpenAIProvider>>,
}

impl LazyTransport {
    fn new(entry: ProviderSettingsEntry) -> Self {
        Self {
            entry,
            transport: OnceCell::new(),
        }
    }

    fn api_key(&self) -> Result<String, Error> {
        self.entry
            .resolved_api_key()
            .ok_or_else(|| Error::auth(format!("{}: API key missing", self.entry.name)))
    }

    async fn initialize(&self, base_url: Option<String>) -> Result<(), Error> {
        self.transport
            .get_or_try_init(|| async move {
                let api_key = self.api_key()?;
                let mut provider = OpenAIProvider::new(api_key).with_name(self.entry.id.clone());
                if let Some(url) = base_url {
                    provider = provider.with_base_url(url);
                }
                debug!(provider = %self.entry.id, base_url = %provider.base_url(), "Provider initialized");
                Ok::<_, Error>(Arc::new(provider))
            })
            .await
            .map(|_| ())
    }

    fn model(&self, model_id: &str) -> Result<ModelHandle, Error> {
        let transport = self.transport.get().ok_or_else(|| {
            Error::config(format!("provider {} is not initialized", self.entry.id))
        })?;
        if model_id.trim().is_empty() {
            return Err(Error::ModelNotFound(format!(
                "empty model id for provider {}",
                self.entry.id
            )));
        }
        Ok(ModelHandle::new(transport.clone(), model_id))
    }

    fn available_models(&self) -> Vec<String> {
        self.entry.models.iter().map(|m| m.model_id.clone()).collect()
    }
}

/// Adapter for api.openai.com. Needs only an API key; `base_url` may
/// point at a proxy.
pub struct OpenAIAdapter {
    inner: LazyTransport,
}

impl OpenAIAdapter {
    pub fn new(entry: ProviderSettingsEntry) -> Self {
        Self {
            inner: LazyTransport::new(entry),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn id(&self) -> &str {
        &self.inner.entry.id
    }

    fn is_initialized(&self) -> bool {
        self.inner.transport.initialized()
    }

    async fn initialize(&self) -> Result<(), Error> {
        let base_url = self
            .inner
            .entry
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty());
        self.inner.initialize(base_url).await
    }

    fn model(&self, model_id: &str) -> Result<ModelHandle, Error> {
        self.inner.model(model_id)
    }

    fn available_models(&self) -> Vec<String> {
        self.inner.available_models()
    }
}

/// Adapter for self-hosted or third-party OpenAI-protocol servers. Needs
/// both an API key and a base URL.
pub struct OpenAICompatibleAdapter {
    inner: LazyTransport,
}

impl OpenAICompatibleAdapter {
    pub fn new(entry: ProviderSettingsEntry) -> Self {
        Self {
            inner: LazyTransport::new(entry),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAICompatibleAdapter {
    fn id(&self) -> &str {
        &self.inner.entry.id
    }

    fn is_initialized(&self) -> bool {
        self.inner.transport.initialized()
    }

    async fn initialize(&self) -> Result<(), Error> {
        let base_url = self
            .inner
            .entry
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                Error::config(format!("{}: base URL missing", self.inner.entry.name))
            })?;
        self.inner.initialize(Some(base_url)).await
    }

    fn model(&self, model_id: &str) -> Result<ModelHandle, Error> {
        self.inner.model(model_id)
    }

    fn available_models(&self) -> Vec<String> {
        self.inner.available_models()
    }
}

/// Construct the adapter for a settings entry. Unknown provider types are
/// rejected here rather than at first use.
pub fn create_adapter(entry: &ProviderSettingsEntry) -> Result<Arc<dyn ProviderAdapter>, Error> {
    match &entry.provider_type {
        ProviderType::OpenAI => Ok(Arc::new(OpenAIAdapter::new(entry.clone()))),
        ProviderType::OpenAICompatible => Ok(Arc::new(OpenAICompatibleAdapter::new(entry.clone()))),
        ProviderType::Unsupported(other) => Err(Error::UnsupportedProvider(other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av_core::ProviderModel;

    fn entry(provider_type: ProviderType) -> ProviderSettingsEntry {
        ProviderSettingsEntry {
            id: "p1".into(),
            name: "Provider One".into(),
            provider_type,
            api_key: Some("sk-test".into()),
            api_key_env: None,
            base_url: None,
            enabled: true,
            models: vec![ProviderModel::new("GPT-5", "gpt-5")],
        }
    }

    #[tokio::test]
    async fn test_openai_initializes_with_key() {
        let adapter = OpenAIAdapter::new(entry(ProviderType::OpenAI));
        assert!(!adapter.is_initialized());
        assert!(adapter.model("gpt-5").is_err());

        adapter.initialize().await.unwrap();
        adapter.initialize().await.unwrap();
        assert!(adapter.is_initialized());

        let model = adapter.model("gpt-5").unwrap();
        assert_eq!(model.model_id(), "gpt-5");
        assert_eq!(model.provider_name(), "p1");
        assert_eq!(adapter.available_models(), vec!["gpt-5".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_key_fails_initialize() {
        let mut e = entry(ProviderType::OpenAI);
        e.api_key = None;
        let adapter = OpenAIAdapter::new(e);
        let err = adapter.initialize().await.unwrap_err();
        assert!(err.is_auth_error());
        assert!(!adapter.is_initialized());
    }

    #[tokio::test]
    async fn test_compatible_requires_base_url() {
        let adapter = OpenAICompatibleAdapter::new(entry(ProviderType::OpenAICompatible));
        assert!(matches!(adapter.initialize().await, Err(Error::Config(_))));

        let mut e = entry(ProviderType::OpenAICompatible);
        e.base_url = Some("http://localhost:11434/v1".into());
        let adapter = OpenAICompatibleAdapter::new(e);
        adapter.initialize().await.unwrap();
        assert!(adapter.is_initialized());
    }

    #[test]
    fn test_unsupported_type_rejected() {
        let err = create_adapter(&entry(ProviderType::Unsupported("Bedrock".into()))).err();
        assert!(matches!(err, Some(Error::UnsupportedProvider(t)) if t == "Bedrock"));
    }
}
