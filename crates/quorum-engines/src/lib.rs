//! Provider adapters and the reliability layer for the Quorum engine.
//!
//! This crate provides the uniform [`adapter::LlmAdapter`] facade over each
//! supported vendor, the registry that names and prioritises adapters, and
//! the machinery that keeps calls dependable: circuit breakers, the
//! fingerprinted response cache, and the fallback cascade.
//!
//! # Supported providers
//!
//! - **OpenAI** - chat completions, SSE streaming, embeddings
//! - **Anthropic** - messages API, SSE streaming
//! - **Google** - Gemini `generateContent`
//! - **Cohere** - chat and embed
//! - **Mistral** - OpenAI-shaped chat
//! - **Custom / LocalRunner** - any OpenAI-compatible endpoint
//! - **Mock** - deterministic responder for tests and fallback
//!
//! # Examples
//!
//! ```rust,no_run
//! use quorum_core::config::{ModelConfig, ProviderKind};
//! use quorum_core::types::GenerationOptions;
//! use quorum_engines::{create_adapter, LlmAdapter};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ModelConfig::from_env(ProviderKind::OpenAi, "gpt-4o");
//! let adapter = create_adapter(&config)?;
//! let answer = adapter.generate("Hello!", &GenerationOptions::default()).await?;
//! println!("{}", answer);
//! # Ok(())
//! # }
//! ```

use log::debug;
use quorum_core::config::{use_mock_from_env, ModelConfig, ProviderKind};
use std::sync::Arc;

pub mod adapter;
pub mod anthropic;
pub mod cache;
pub mod circuit_breaker;
pub mod cohere;
pub mod fallback;
pub mod google;
pub mod mistral;
pub mod mock;
pub mod openai;
pub mod registry;
mod sse;

use anthropic::AnthropicAdapter;
use cohere::CohereAdapter;
use google::GoogleAdapter;
use mistral::MistralAdapter;
use mock::MockAdapter;
use openai::OpenAiAdapter;

pub use adapter::{Capabilities, ChunkStream, LlmAdapter};
pub use registry::AdapterRegistry;

/// Resolve a [`ModelConfig`] to a concrete adapter.
///
/// Missing credentials are filled in from the environment by the
/// `<PROVIDER>_API_KEY` / `<PROVIDER>_API_BASE` convention, and with
/// `USE_MOCK=true` any provider still lacking a key gets the mock adapter
/// substituted in its place.
pub fn create_adapter(config: &ModelConfig) -> anyhow::Result<Arc<dyn LlmAdapter>> {
    let mut config = config.clone();
    config.validate()?;

    if config.api_key.is_none() {
        config.api_key = config.provider.api_key_from_env();
    }
    if config.api_base.is_none() {
        config.api_base = config.provider.api_base_from_env();
    }

    if config.provider.requires_key() && config.api_key.is_none() && use_mock_from_env() {
        debug!(
            "USE_MOCK set and no credentials for {}, substituting mock adapter",
            config.model_id
        );
        return Ok(Arc::new(MockAdapter::new(config.model_id)));
    }

    let adapter: Arc<dyn LlmAdapter> = match config.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(config)?),
        ProviderKind::Google => Arc::new(GoogleAdapter::new(config)?),
        ProviderKind::Cohere => Arc::new(CohereAdapter::new(config)?),
        ProviderKind::Mistral => Arc::new(MistralAdapter::new(config)?),
        ProviderKind::Custom | ProviderKind::LocalRunner => {
            Arc::new(OpenAiAdapter::compatible(config)?)
        }
        ProviderKind::Mock => Arc::new(MockAdapter::new(config.model_id)),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_maps_providers() {
        let mock = create_adapter(&ModelConfig::new(ProviderKind::Mock, "m")).unwrap();
        assert_eq!(mock.provider(), ProviderKind::Mock);

        let openai =
            create_adapter(&ModelConfig::new(ProviderKind::OpenAi, "gpt-4o").with_api_key("k"))
                .unwrap();
        assert_eq!(openai.provider(), ProviderKind::OpenAi);

        let local = create_adapter(
            &ModelConfig::new(ProviderKind::LocalRunner, "llama3")
                .with_api_base("http://localhost:8080/v1"),
        )
        .unwrap();
        assert_eq!(local.provider(), ProviderKind::LocalRunner);
        assert!(local.is_available());
    }

    #[test]
    fn factory_rejects_invalid_configs() {
        let invalid = ModelConfig::new(ProviderKind::Mock, "m").with_weight(-2.0);
        assert!(create_adapter(&invalid).is_err());
    }
}
