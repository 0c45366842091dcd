// crates/quorum-engines/src/cohere.rs

//! Cohere chat and embed adapter.

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

const DEFAULT_API_BASE: &str = "https://api.cohere.ai";
const DEFAULT_EMBEDDING_MODEL: &str = "embed-english-v3.0";

pub struct CohereAdapter {
    config: ModelConfig,
    client: Client,
    gate: RateGate,
    api_base: String,
}

impl CohereAdapter {
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

    async fn post(&self, url: &str, payload: &Value) -> ProviderResult<Value> {
        let key = self.config.api_key.as_deref().ok_or_else(|| {
            ProviderError::unauthorized("missing API key")
                .with_provider("cohere")
                .with_model(self.id())
        })?;

        self.gate.wait().await;
        debug!("POST {} model={}", url, self.config.model_id);

        let response = self
            .client
            .post(url)
            .bearer_auth(key)
            .json(payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(e, "cohere").with_model(self.id()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, "cohere", &body).with_model(self.id()));
        }

        response.json().await.map_err(|e| {
            ProviderError::internal(format!("failed to decode response: {}", e))
                .with_provider("cohere")
                .with_model(self.id())
        })
    }
}

#[async_trait]
impl LlmAdapter for CohereAdapter {
    fn id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Cohere
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> ProviderResult<String> {
        let url = format!("{}/v1/chat", self.api_base);
        let payload = json!({
            "model": self.config.model_id,
            "message": prompt,
            "max_tokens": options.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": options.temperature.unwrap_or(self.config.temperature),
        });
        let body = self.post(&url, &payload).await?;

        body["text"].as_str().map(String::from).ok_or_else(|| {
            ProviderError::internal("no completion content in response")
                .with_provider("cohere")
                .with_model(self.id())
        })
    }

    async fn get_embedding(&self, text: &str) -> ProviderResult<Vec<f32>> {
        let url = format!("{}/v1/embed", self.api_base);
        let payload = json!({
            "model": DEFAULT_EMBEDDING_MODEL,
            "texts": [text],
            "input_type": "search_document",
        });
        let body = self.post(&url, &payload).await?;

        body["embeddings"][0]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64())
                    .map(|v| v as f32)
                    .collect()
            })
            .ok_or_else(|| {
                ProviderError::internal("no embedding in response").with_provider("cohere")
            })
    }

    fn is_available(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "cohere".to_string(),
            supports_streaming: false,
            supports_embeddings: true,
            supports_vision: false,
            max_tokens: self.config.max_tokens,
        }
    }
}
