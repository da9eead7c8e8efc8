//! av-providers: model provider adapters for agent-vault
//!
//! This crate provides the OpenAI-protocol transport, the adapters that
//! lazily build it from provider settings, and the `ProviderManager` that
//! owns them.

pub mod adapter;
pub mod manager;
pub mod openai;

pub use adapter::{create_adapter, OpenAIAdapter, OpenAICompatibleAdapter};
pub use manager::{model_key, split_model_key, ModelGroup, ModelOption, ProviderManager};
pub use openai::OpenAIProvider;
