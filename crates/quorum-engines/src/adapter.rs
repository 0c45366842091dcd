// crates/quorum-engines/src/adapter.rs

//! The uniform adapter contract every provider implements, plus the shared
//! HTTP plumbing: client construction, status classification, and per-adapter
//! rate limiting.

use async_trait::async_trait;
use futures::stream::Stream;
use quorum_core::config::ProviderKind;
use quorum_core::error::{ProviderError, ProviderResult};
use quorum_core::types::GenerationOptions;
use reqwest::{Client, StatusCode};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Finite, non-restartable sequence of text chunks from one streaming call.
///
/// Aggregating every chunk yields exactly the text a plain `generate` call
/// would return for the same inputs.
pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderResult<String>> + Send>>;

/// Static description of what an adapter can do.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Capabilities {
    pub name: String,
    pub supports_streaming: bool,
    pub supports_embeddings: bool,
    pub supports_vision: bool,
    pub max_tokens: u32,
}

/// Uniform facade over one LLM vendor's wire protocol.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Registry id of this adapter (usually the model id).
    fn id(&self) -> &str;

    /// The backend this adapter speaks to.
    fn provider(&self) -> ProviderKind;

    /// Return the full completion, or a classified failure.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> ProviderResult<String>;

    /// Stream the completion as it is produced.
    ///
    /// The default implementation satisfies the aggregate-equals-generate
    /// contract trivially by yielding the whole completion as one chunk;
    /// adapters with native streaming override it.
    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> ProviderResult<ChunkStream> {
        let content = self.generate(prompt, options).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(content) })))
    }

    /// Embed a text. Adapters without embedding support fail with
    /// `NotSupported`.
    async fn get_embedding(&self, _text: &str) -> ProviderResult<Vec<f32>> {
        Err(ProviderError::not_supported("embeddings")
            .with_provider(self.provider().to_string())
            .with_model(self.id()))
    }

    /// Cheap local availability check: credentials present, client built.
    /// Never touches the network.
    fn is_available(&self) -> bool;

    fn capabilities(&self) -> Capabilities;
}

/// Minimum inter-call spacing for one adapter instance.
///
/// A new call is delayed until `min_interval` has elapsed since the previous
/// call started; concurrent callers queue behind the gate in arrival order.
pub struct RateGate {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Build the reusable HTTP client shared by all calls of one adapter.
pub fn build_http_client(timeout: Duration) -> ProviderResult<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| ProviderError::internal(format!("failed to build HTTP client: {}", e)))
}

/// Translate an HTTP error status into the adapter error taxonomy.
pub fn classify_status(status: StatusCode, provider: &str, body: &str) -> ProviderError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    let error = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::rate_limited(message),
        StatusCode::REQUEST_TIMEOUT => ProviderError::timeout(message),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::bad_request(message)
        }
        s if s.is_server_error() => ProviderError::unavailable(message),
        _ => ProviderError::internal(message),
    };
    error.with_provider(provider)
}

/// Translate a transport-level reqwest failure.
pub fn classify_transport_error(err: reqwest::Error, provider: &str) -> ProviderError {
    let error = if err.is_timeout() {
        ProviderError::timeout(err.to_string())
    } else if err.is_connect() {
        ProviderError::unavailable(err.to_string())
    } else {
        ProviderError::internal(err.to_string())
    };
    error.with_provider(provider)
}

/// Effective deadline for one call: the smaller of the per-call option and
/// the model's configured timeout.
pub fn effective_timeout(options: &GenerationOptions, config_timeout: Duration) -> Duration {
    match options.timeout {
        Some(requested) => requested.min(config_timeout),
        None => config_timeout,
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
