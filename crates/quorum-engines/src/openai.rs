// crates/quorum-engines/src/openai.rs

//! OpenAI chat-completions adapter.
//!
//! Also backs the `Custom` and `LocalRunner` providers, which speak the same
//! wire protocol against a caller-supplied `api_base`.

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

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

pub struct OpenAiAdapter {
    config: ModelConfig,
    client: Client,
    gate: RateGate,
    api_base: String,
    kind: ProviderKind,
}

impl OpenAiAdapter {
    pub fn new(config: ModelConfig) -> ProviderResult<Self> {
        Self::with_kind(config, ProviderKind::OpenAi)
    }

    /// OpenAI-compatible endpoint: local model runners and custom gateways.
    pub fn compatible(config: ModelConfig) -> ProviderResult<Self> {
        let kind = config.provider;
        Self::with_kind(config, kind)
    }

    fn with_kind(config: ModelConfig, kind: ProviderKind) -> ProviderResult<Self> {
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
            kind,
        })
    }

    fn provider_name(&self) -> &'static str {
        match self.kind {
            ProviderKind::Custom => "custom",
            ProviderKind::LocalRunner => "local_runner",
            _ => "openai",
        }
    }

    fn chat_payload(&self, prompt: &str, options: &GenerationOptions, stream: bool) -> Value {
        let mut payload = json!({
            "model": self.config.model_id,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": options.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": options.temperature.unwrap_or(self.config.temperature),
        });
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    async fn post(&self, url: &str, payload: &Value) -> ProviderResult<reqwest::Response> {
        self.gate.wait().await;
        debug!("POST {} model={}", url, self.config.model_id);

        let mut request = self.client.post(url).json(payload);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(e, self.provider_name()).with_model(self.id()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, self.provider_name(), &body).with_model(self.id()));
        }
        Ok(response)
    }

    fn extract_delta(data: &str) -> Option<String> {
        let value: Value = serde_json::from_str(data).ok()?;
        let delta = value["choices"][0]["delta"]["content"].as_str()?;
        if delta.is_empty() {
            None
        } else {
            Some(delta.to_string())
        }
    }
}

#[async_trait]
impl LlmAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        &self.config.model_id
    }

    fn provider(&self) -> ProviderKind {
        self.kind
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> ProviderResult<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = self.chat_payload(prompt, options, false);
        let response = self.post(&url, &payload).await?;

        let body: Value = response.json().await.map_err(|e| {
            ProviderError::internal(format!("failed to decode response: {}", e))
                .with_provider(self.provider_name())
                .with_model(self.id())
        })?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::internal("no completion content in response")
                    .with_provider(self.provider_name())
                    .with_model(self.id())
            })
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> ProviderResult<ChunkStream> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = self.chat_payload(prompt, options, true);
        let response = self.post(&url, &payload).await?;
        let provider = self.provider_name();

        let mut lines = sse::data_lines(response, provider);
        Ok(Box::pin(async_stream::stream! {
            while let Some(line) = lines.next().await {
                match line {
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                    Ok(data) if data == "[DONE]" => return,
                    Ok(data) => {
                        if let Some(delta) = OpenAiAdapter::extract_delta(&data) {
                            yield Ok(delta);
                        }
                    }
                }
            }
        }))
    }

    async fn get_embedding(&self, text: &str) -> ProviderResult<Vec<f32>> {
        if self.kind != ProviderKind::OpenAi {
            return Err(ProviderError::not_supported("embeddings")
                .with_provider(self.provider_name())
                .with_model(self.id()));
        }

        let url = format!("{}/embeddings", self.api_base);
        let payload = json!({
            "model": DEFAULT_EMBEDDING_MODEL,
            "input": text,
        });
        let response = self.post(&url, &payload).await?;
        let body: Value = response.json().await.map_err(|e| {
            ProviderError::internal(format!("failed to decode embedding response: {}", e))
                .with_provider(self.provider_name())
        })?;

        body["data"][0]["embedding"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64())
                    .map(|v| v as f32)
                    .collect()
            })
            .ok_or_else(|| {
                ProviderError::internal("no embedding in response").with_provider(self.provider_name())
            })
    }

    fn is_available(&self) -> bool {
        !self.kind.requires_key() || self.config.api_key.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: self.provider_name().to_string(),
            supports_streaming: true,
            supports_embeddings: self.kind == ProviderKind::OpenAi,
            supports_vision: self.kind == ProviderKind::OpenAi
                && self.config.model_id.contains("gpt-4"),
            max_tokens: self.config.max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(kind: ProviderKind) -> OpenAiAdapter {
        let config = ModelConfig::new(kind, "gpt-4o").with_api_key("sk-test");
        OpenAiAdapter::compatible(config).unwrap()
    }

    #[test]
    fn payload_uses_config_defaults() {
        let payload = adapter(ProviderKind::OpenAi).chat_payload("hi", &GenerationOptions::default(), false);
        assert_eq!(payload["model"], "gpt-4o");
        assert_eq!(payload["max_tokens"], 1024);
        assert!(payload.get("stream").is_none());
    }

    #[test]
    fn payload_honours_per_call_options() {
        let options = GenerationOptions {
            max_tokens: Some(64),
            temperature: Some(0.1),
            ..Default::default()
        };
        let payload = adapter(ProviderKind::OpenAi).chat_payload("hi", &options, true);
        assert_eq!(payload["max_tokens"], 64);
        assert_eq!(payload["stream"], true);
    }

    #[test]
    fn delta_extraction() {
        let data = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        assert_eq!(OpenAiAdapter::extract_delta(data).as_deref(), Some("hel"));
        assert_eq!(OpenAiAdapter::extract_delta(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(OpenAiAdapter::extract_delta("not json"), None);
    }

    #[test]
    fn availability_tracks_credentials() {
        let with_key = adapter(ProviderKind::OpenAi);
        assert!(with_key.is_available());

        let keyless = OpenAiAdapter::new(ModelConfig::new(ProviderKind::OpenAi, "gpt-4o")).unwrap();
        assert!(!keyless.is_available());

        // Local runners work without credentials.
        let local =
            OpenAiAdapter::compatible(ModelConfig::new(ProviderKind::LocalRunner, "llama3")).unwrap();
        assert!(local.is_available());
    }
}
