// crates/quorum-engines/src/mistral.rs

//! Mistral chat adapter (OpenAI-shaped wire protocol).

use crate::adapter::{
    build_http_client, classify_status, classify_transport_error, Capabilities, LlmAdapter,
    RateGate,
};
use async_trait::async_trait;
use log::debug;
use quorum_core::config::{ModelConfig, ProviderKind};
use quorum_core::error::{ProviderError, ProviderResult};
use quorum_core::types::GenerationOptions;
use reqwest::Client;
use serde_json::{json, Value};

const DEFAULT_API_BASE: &str = "https://api.mistral.ai";

pub struct MistralAdapter {
    config: ModelConfig,
    client: Client,
    gate: RateGate,
    api_base: String,
}

impl MistralAdapter {
    pub fn new(config: ModelConfig) -> ProviderResult<Self> {
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let client = build_http_client(config.timeout)?;
        let gate = RateGate::new(config.rate_limit);
        Ok(Self {
            config,
            client,
            gate,
            api_base,
        })
    }
}

#[async_trait]
impl LlmAdapter for MistralAdapter {
    fn id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Mistral
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> ProviderResult<String> {
        let key = self.config.api_key.as_deref().ok_or_else(|| {
            ProviderError::unauthorized("missing API key")
                .with_provider("mistral")
                .with_model(self.id())
        })?;

        self.gate.wait().await;
        let url = format!("{}/v1/chat/completions", self.api_base);
        debug!("POST {} model={}", url, self.config.model_id);

        let payload = json!({
            "model": self.config.model_id,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": options.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": options.temperature.unwrap_or(self.config.temperature),
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(e, "mistral").with_model(self.id()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, "mistral", &body).with_model(self.id()));
        }

        let body: Value = response.json().await.map_err(|e| {
            ProviderError::internal(format!("failed to decode response: {}", e))
                .with_provider("mistral")
                .with_model(self.id())
        })?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::internal("no completion content in response")
                    .with_provider("mistral")
                    .with_model(self.id())
            })
    }

    fn is_available(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "mistral".to_string(),
            supports_streaming: false,
            supports_embeddings: false,
            supports_vision: false,
            max_tokens: self.config.max_tokens,
        }
    }
}
