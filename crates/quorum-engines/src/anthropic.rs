// crates/quorum-engines/src/anthropic.rs

//! Anthropic messages-API adapter.

use crate::adapter::{
    build_http_client, classify_status, classify_transport_error, Capabilities, ChunkStream,
    LlmAdapter, RateGate,
};
use crate::sse;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use quorum_core::config::{ModelConfig, ProviderKind};
use quorum_core::error::{ProviderError, ProviderResult};
use quorum_core::types::GenerationOptions;
use reqwest::Client;
use serde_json::{json, Value};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    config: ModelConfig,
    client: Client,
    gate: RateGate,
    api_base: String,
}

impl AnthropicAdapter {
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

    fn payload(&self, prompt: &str, options: &GenerationOptions, stream: bool) -> Value {
        let mut payload = json!({
            "model": self.config.model_id,
            "max_tokens": options.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": options.temperature.unwrap_or(self.config.temperature),
            "messages": [{ "role": "user", "content": prompt }],
        });
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    async fn post(&self, payload: &Value) -> ProviderResult<reqwest::Response> {
        let key = self.config.api_key.as_deref().ok_or_else(|| {
            ProviderError::unauthorized("missing API key")
                .with_provider("anthropic")
                .with_model(self.id())
        })?;

        self.gate.wait().await;
        let url = format!("{}/v1/messages", self.api_base);
        debug!("POST {} model={}", url, self.config.model_id);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(e, "anthropic").with_model(self.id()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, "anthropic", &body).with_model(self.id()));
        }
        Ok(response)
    }

    fn extract_delta(data: &str) -> Option<String> {
        let value: Value = serde_json::from_str(data).ok()?;
        match value["type"].as_str()? {
            "content_block_delta" => {
                let text = value["delta"]["text"].as_str()?;
                if text.is_empty() {
                    None
                } else {
                    Some(text.to_string())
                }
            }
            _ => None,
        }
    }
}

#[async_trait]
impl LlmAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> ProviderResult<String> {
        let payload = self.payload(prompt, options, false);
        let response = self.post(&payload).await?;

        let body: Value = response.json().await.map_err(|e| {
            ProviderError::internal(format!("failed to decode response: {}", e))
                .with_provider("anthropic")
                .with_model(self.id())
        })?;

        if let Some(error) = body.get("error") {
            return Err(ProviderError::internal(format!("API error: {}", error))
                .with_provider("anthropic")
                .with_model(self.id()));
        }

        body["content"][0]["text"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::internal("no completion content in response")
                    .with_provider("anthropic")
                    .with_model(self.id())
            })
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> ProviderResult<ChunkStream> {
        let payload = self.payload(prompt, options, true);
        let response = self.post(&payload).await?;

        let mut lines = sse::data_lines(response, "anthropic");
        Ok(Box::pin(async_stream::stream! {
            while let Some(line) = lines.next().await {
                match line {
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                    Ok(data) => {
                        if let Some(text) = AnthropicAdapter::extract_delta(&data) {
                            yield Ok(text);
                        } else if serde_json::from_str::<Value>(&data)
                            .ok()
                            .and_then(|v| v["type"].as_str().map(|t| t == "message_stop"))
                            .unwrap_or(false)
                        {
                            return;
                        }
                    }
                }
            }
        }))
    }

    fn is_available(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "anthropic".to_string(),
            supports_streaming: true,
            supports_embeddings: false,
            supports_vision: self.config.model_id.contains("claude-3"),
            max_tokens: self.config.max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_extraction_filters_event_types() {
        let delta = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}"#;
        assert_eq!(AnthropicAdapter::extract_delta(delta).as_deref(), Some("hi"));

        let start = r#"{"type":"message_start","message":{}}"#;
        assert_eq!(AnthropicAdapter::extract_delta(start), None);
    }

    #[test]
    fn embedding_is_not_supported() {
        let config = ModelConfig::new(ProviderKind::Anthropic, "claude-3-5-sonnet").with_api_key("k");
        let adapter = AnthropicAdapter::new(config).unwrap();
        assert!(!adapter.capabilities().supports_embeddings);
        let err = tokio_test::block_on(adapter.get_embedding("text")).unwrap_err();
        assert_eq!(err.kind, quorum_core::error::ErrorKind::NotSupported);
    }

    #[test]
    fn availability_requires_key() {
        let keyless = AnthropicAdapter::new(ModelConfig::new(ProviderKind::Anthropic, "claude-3-haiku")).unwrap();
        assert!(!keyless.is_available());
    }
}
