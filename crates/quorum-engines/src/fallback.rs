// crates/quorum-engines/src/fallback.rs

//! The reliability envelope around a single generate call: cache
//! short-circuit, ordered provider candidates, circuit breaker gating,
//! bounded retries with exponential backoff, and a mock last resort.

use crate::adapter::{effective_timeout, ChunkStream, LlmAdapter};
use crate::cache::{CacheKey, ResponseCache};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::mock::MockAdapter;
use crate::registry::{AdapterRegistry, Registration};
use log::{debug, info, warn};
use quorum_core::config::OrchestratorConfig;
use quorum_core::error::{ProviderError, ProviderResult};
use quorum_core::types::GenerationOptions;
use rand::Rng;
use self::stream_forward::forward_with_recording;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    pub circuit_breaker_enabled: bool,
    pub enable_mock_fallback: bool,
}

impl FallbackConfig {
    pub fn from_orchestrator(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            jitter: config.retry_jitter,
            circuit_breaker_enabled: config.circuit_breaker_enabled,
            enable_mock_fallback: config.enable_mock_fallback,
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self::from_orchestrator(&OrchestratorConfig::default())
    }
}

/// Outcome of one reliability-wrapped call.
#[derive(Debug, Clone)]
pub struct FallbackReply {
    pub content: String,
    /// Adapter that produced the answer
    pub served_by: String,
    pub cached: bool,
    pub mock_fallback: bool,
    /// Adapter invocations spent, across all candidates
    pub attempts: u32,
}

/// A reliability-wrapped stream plus its provenance.
pub struct FallbackStream {
    pub chunks: ChunkStream,
    pub served_by: String,
    pub cached: bool,
    pub mock_fallback: bool,
}

/// Called before each retry sleep, letting callers surface retry progress.
pub type RetryHook = Arc<dyn Fn(&str, u32) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub available: bool,
    pub breaker: CircuitState,
    pub weight: f64,
}

pub struct FallbackService {
    registry: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: ResponseCache,
    config: FallbackConfig,
    /// Explicit candidate orderings per requested model id
    aliases: RwLock<HashMap<String, Vec<String>>>,
    mock: MockAdapter,
}

impl FallbackService {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        cache: ResponseCache,
        config: FallbackConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            cache,
            config,
            aliases: RwLock::new(HashMap::new()),
            mock: MockAdapter::new("mock-fallback"),
        }
    }

    /// Pin an explicit candidate ordering for a model id.
    pub fn set_candidates(&self, model_id: impl Into<String>, candidates: Vec<String>) {
        if let Ok(mut aliases) = self.aliases.write() {
            aliases.insert(model_id.into(), candidates);
        }
    }

    /// Ordered provider candidates for a requested model: the explicit
    /// mapping (or the model itself) first, then the remaining registry in
    /// priority order.
    fn candidates_for(&self, model_id: &str) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        let mapped = self
            .aliases
            .read()
            .ok()
            .and_then(|aliases| aliases.get(model_id).cloned());
        match mapped {
            Some(explicit) => candidates.extend(explicit),
            None => {
                if self.registry.contains(model_id) {
                    candidates.push(model_id.to_string());
                }
            }
        }
        for id in self.registry.prioritized(None) {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        candidates
    }

    fn cache_key(
        &self,
        model_id: &str,
        stage: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) -> CacheKey {
        let provider = self
            .registry
            .get(model_id)
            .map(|reg| reg.config.provider.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        CacheKey::new(provider, model_id, stage, prompt).with_options(options)
    }

    pub async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        stage: &str,
        options: &GenerationOptions,
    ) -> ProviderResult<FallbackReply> {
        self.generate_with_hook(model_id, prompt, stage, options, None)
            .await
    }

    pub async fn generate_with_hook(
        &self,
        model_id: &str,
        prompt: &str,
        stage: &str,
        options: &GenerationOptions,
        retry_hook: Option<RetryHook>,
    ) -> ProviderResult<FallbackReply> {
        let key = self.cache_key(model_id, stage, prompt, options);
        if !options.skip_cache {
            if let Some(content) = self.cache.get(&key) {
                debug!("cache hit for {} at stage {}", model_id, stage);
                return Ok(FallbackReply {
                    content,
                    served_by: model_id.to_string(),
                    cached: true,
                    mock_fallback: false,
                    attempts: 0,
                });
            }
        }

        let candidates = self.candidates_for(model_id);
        let mut last_error: Option<ProviderError> = None;
        let mut attempts = 0u32;

        for candidate in &candidates {
            let Some(registration) = self.registry.get(candidate) else {
                continue;
            };

            let breaker = self.breakers.get_or_create(&breaker_key(candidate));
            if self.config.circuit_breaker_enabled && !breaker.allow_request() {
                warn!("circuit open for {}, skipping", candidate);
                if last_error.is_none() {
                    last_error = Some(
                        ProviderError::circuit_open(candidate.clone()).with_model(model_id),
                    );
                }
                continue;
            }

            let deadline = effective_timeout(options, registration.config.timeout);
            let mut exhausted_retryably = false;

            for attempt in 0..self.config.max_retries {
                attempts += 1;
                let outcome = tokio::time::timeout(
                    deadline,
                    registration.adapter.generate(prompt, options),
                )
                .await;

                let error = match outcome {
                    Ok(Ok(content)) => {
                        breaker.record_success();
                        if !options.skip_cache {
                            match options.cache_ttl {
                                Some(ttl) => self.cache.set_with_ttl(&key, content.clone(), ttl),
                                None => self.cache.set(&key, content.clone()),
                            }
                        }
                        return Ok(FallbackReply {
                            content,
                            served_by: candidate.clone(),
                            cached: false,
                            mock_fallback: false,
                            attempts,
                        });
                    }
                    Ok(Err(error)) => error,
                    Err(_) => ProviderError::timeout(format!(
                        "call exceeded deadline of {:?}",
                        deadline
                    ))
                    .with_model(candidate.clone()),
                };

                warn!(
                    "error calling {} (attempt {}/{}): {}",
                    candidate,
                    attempt + 1,
                    self.config.max_retries,
                    error
                );
                let retryable = error.is_retryable();
                last_error = Some(error);

                if !retryable {
                    // A non-retryable ending never counts toward the breaker.
                    exhausted_retryably = false;
                    break;
                }
                exhausted_retryably = true;
                if attempt + 1 < self.config.max_retries {
                    if let Some(hook) = &retry_hook {
                        hook(candidate, attempt + 1);
                    }
                    let delay = backoff_delay(
                        attempt,
                        self.config.base_delay,
                        self.config.max_delay,
                        self.config.jitter,
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            // Only retryable exhaustion counts toward the breaker.
            if exhausted_retryably {
                breaker.record_failure();
            }
        }

        if self.config.enable_mock_fallback {
            info!("all providers failed for {}, using mock fallback", model_id);
            let content = self.mock.generate(prompt, options).await?;
            return Ok(FallbackReply {
                content,
                served_by: "mock-fallback".to_string(),
                cached: false,
                mock_fallback: true,
                attempts,
            });
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::internal(format!("no adapters registered for model {}", model_id))
                .with_model(model_id)
        }))
    }

    /// Streaming variant of the cascade. Cached and mock answers come back
    /// as a single chunk; live streams are recorded into the cache as they
    /// pass through and finalised when the stream closes cleanly.
    pub async fn stream_generate(
        &self,
        model_id: &str,
        prompt: &str,
        stage: &str,
        options: &GenerationOptions,
    ) -> ProviderResult<FallbackStream> {
        let key = self.cache_key(model_id, stage, prompt, options);
        if !options.skip_cache {
            if let Some(chunks) = self.cache.get_stream(&key) {
                debug!("stream cache hit for {} at stage {}", model_id, stage);
                let replay = chunks.concat();
                return Ok(FallbackStream {
                    chunks: Box::pin(futures::stream::once(async move { Ok(replay) })),
                    served_by: model_id.to_string(),
                    cached: true,
                    mock_fallback: false,
                });
            }
        }

        let candidates = self.candidates_for(model_id);
        let mut last_error: Option<ProviderError> = None;

        for candidate in &candidates {
            let Some(registration) = self.registry.get(candidate) else {
                continue;
            };

            let breaker = self.breakers.get_or_create(&breaker_key(candidate));
            if self.config.circuit_breaker_enabled && !breaker.allow_request() {
                warn!("circuit open for {}, skipping stream", candidate);
                if last_error.is_none() {
                    last_error = Some(
                        ProviderError::circuit_open(candidate.clone()).with_model(model_id),
                    );
                }
                continue;
            }

            let deadline = effective_timeout(options, registration.config.timeout);
            let mut exhausted_retryably = false;

            for attempt in 0..self.config.max_retries {
                let outcome = tokio::time::timeout(
                    deadline,
                    registration.adapter.stream_generate(prompt, options),
                )
                .await;

                let error = match outcome {
                    Ok(Ok(chunks)) => {
                        let recorder = if options.skip_cache {
                            None
                        } else {
                            Some(self.cache.begin_stream(&key))
                        };
                        let wrapped = forward_with_recording(chunks, recorder, breaker.clone());
                        return Ok(FallbackStream {
                            chunks: wrapped,
                            served_by: candidate.clone(),
                            cached: false,
                            mock_fallback: false,
                        });
                    }
                    Ok(Err(error)) => error,
                    Err(_) => ProviderError::timeout(format!(
                        "stream setup exceeded deadline of {:?}",
                        deadline
                    ))
                    .with_model(candidate.clone()),
                };

                warn!(
                    "error streaming from {} (attempt {}/{}): {}",
                    candidate,
                    attempt + 1,
                    self.config.max_retries,
                    error
                );
                let retryable = error.is_retryable();
                last_error = Some(error);

                if !retryable {
                    exhausted_retryably = false;
                    break;
                }
                exhausted_retryably = true;
                if attempt + 1 < self.config.max_retries {
                    let delay = backoff_delay(
                        attempt,
                        self.config.base_delay,
                        self.config.max_delay,
                        self.config.jitter,
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            if exhausted_retryably {
                breaker.record_failure();
            }
        }

        if self.config.enable_mock_fallback {
            info!(
                "all providers failed for streaming {}, using mock fallback",
                model_id
            );
            let content = self.mock.generate(prompt, options).await?;
            return Ok(FallbackStream {
                chunks: Box::pin(futures::stream::once(async move { Ok(content) })),
                served_by: "mock-fallback".to_string(),
                cached: false,
                mock_fallback: true,
            });
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::internal(format!("no adapters registered for model {}", model_id))
                .with_model(model_id)
        }))
    }

    /// Availability and breaker state per registered model.
    pub fn provider_status(&self) -> HashMap<String, ProviderStatus> {
        self.registry
            .list()
            .into_iter()
            .filter_map(|id| {
                let Registration { adapter, config } = self.registry.get(&id)?;
                let breaker = self.breakers.get_or_create(&breaker_key(&id));
                Some((
                    id,
                    ProviderStatus {
                        provider: config.provider.to_string(),
                        available: adapter.is_available(),
                        breaker: breaker.state(),
                        weight: config.weight,
                    },
                ))
            })
            .collect()
    }
}

fn breaker_key(adapter_id: &str) -> String {
    format!("llm:{}", adapter_id)
}

/// Delay before retry attempt `attempt + 1` (zero-based `attempt`):
/// `base · 2^attempt` plus up to `jitter`, capped at `max_delay`.
pub fn backoff_delay(attempt: u32, base: Duration, max_delay: Duration, jitter: Duration) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt));
    let jitter_ms = if jitter.is_zero() {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter.as_millis() as u64)
    };
    (exponential + Duration::from_millis(jitter_ms)).min(max_delay)
}

/// Stream forwarding with cache recording and breaker bookkeeping.
mod stream_forward {
    use super::*;
    use crate::cache::StreamRecorder;
    use crate::circuit_breaker::CircuitBreaker;
    use futures_util::StreamExt;

    pub fn forward_with_recording(
        mut upstream: ChunkStream,
        recorder: Option<StreamRecorder>,
        breaker: Arc<CircuitBreaker>,
    ) -> ChunkStream {
        Box::pin(async_stream::stream! {
            let mut failed = false;
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(recorder) = &recorder {
                            recorder.push(&chunk);
                        }
                        yield Ok(chunk);
                    }
                    Err(error) => {
                        failed = true;
                        if error.is_retryable() {
                            breaker.record_failure();
                        }
                        yield Err(error);
                        break;
                    }
                }
            }
            if !failed {
                breaker.record_success();
                if let Some(recorder) = recorder {
                    recorder.finish();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use futures_util::StreamExt;
    use quorum_core::config::{ModelConfig, ProviderKind};
    use quorum_core::error::ErrorKind;
    use std::sync::Arc;

    fn fast_config() -> FallbackConfig {
        FallbackConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: Duration::from_millis(1),
            circuit_breaker_enabled: true,
            enable_mock_fallback: false,
        }
    }

    fn service_with(config: FallbackConfig) -> (Arc<AdapterRegistry>, FallbackService) {
        let registry = Arc::new(AdapterRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let cache = ResponseCache::new(CacheConfig::default());
        let service = FallbackService::new(
            Arc::clone(&registry),
            breakers,
            cache,
            config,
        );
        (registry, service)
    }

    fn register_mock(registry: &AdapterRegistry, adapter: MockAdapter, weight: f64) -> Arc<MockAdapter> {
        let id = adapter.id().to_string();
        let shared = Arc::new(adapter);
        registry
            .register(
                ModelConfig::new(ProviderKind::Mock, id).with_weight(weight),
                shared.clone(),
            )
            .unwrap();
        shared
    }

    #[tokio::test]
    async fn cache_hit_skips_the_adapter() {
        let (registry, service) = service_with(fast_config());
        let adapter = register_mock(&registry, MockAdapter::with_response("mA", "ok"), 1.0);
        let options = GenerationOptions::default();

        let first = service.generate("mA", "q", "initial", &options).await.unwrap();
        assert!(!first.cached);
        assert_eq!(adapter.call_count(), 1);

        let second = service.generate("mA", "q", "initial", &options).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.content, first.content);
        // Byte-identical replay with no further adapter invocation.
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn skip_cache_forces_live_calls() {
        let (registry, service) = service_with(fast_config());
        let adapter = register_mock(&registry, MockAdapter::with_response("mA", "ok"), 1.0);
        let options = GenerationOptions::uncached();

        service.generate("mA", "q", "initial", &options).await.unwrap();
        service.generate("mA", "q", "initial", &options).await.unwrap();
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn cascade_skips_unauthorized_and_lands_on_healthy_candidate() {
        let (registry, service) = service_with(fast_config());
        let p1 = register_mock(
            &registry,
            MockAdapter::failing_with("p1", ErrorKind::Unauthorized),
            3.0,
        );
        let p2 = register_mock(
            &registry,
            MockAdapter::failing_with("p2", ErrorKind::Timeout),
            2.0,
        );
        let p3 = register_mock(&registry, MockAdapter::with_response("p3", "ok"), 1.0);
        service.set_candidates("X", vec!["p1".into(), "p2".into(), "p3".into()]);

        let reply = service
            .generate("X", "q", "initial", &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.content, "ok");
        assert_eq!(reply.served_by, "p3");

        // Non-retryable p1 is not retried; p2 uses every retry attempt.
        assert_eq!(p1.call_count(), 1);
        assert_eq!(p2.call_count(), 3);
        assert_eq!(p3.call_count(), 1);

        // p1's unauthorized failure never reached its breaker; p3 recorded a success.
        let status = service.provider_status();
        assert_eq!(status["p1"].breaker, CircuitState::Closed);
        assert_eq!(status["p3"].breaker, CircuitState::Closed);
    }

    #[tokio::test]
    async fn breaker_trips_after_threshold_and_recovers_on_probe() {
        let registry = Arc::new(AdapterRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            crate::circuit_breaker::BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_millis(400),
            },
        ));
        let service = FallbackService::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            ResponseCache::with_defaults(),
            fast_config(),
        );
        let adapter = register_mock(
            &registry,
            MockAdapter::failing_with("mB", ErrorKind::ProviderUnavailable),
            1.0,
        );
        let options = GenerationOptions::uncached();

        // Three calls exhaust retries and trip the breaker.
        for _ in 0..3 {
            let err = service.generate("mB", "q", "initial", &options).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
        }
        let calls_when_open = adapter.call_count();
        assert_eq!(calls_when_open, 9); // 3 calls x 3 retries

        // Calls 4 and 5 are rejected without touching the adapter.
        for _ in 0..2 {
            let err = service.generate("mB", "q", "initial", &options).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::CircuitOpen);
        }
        assert_eq!(adapter.call_count(), calls_when_open);

        // After recovery, one successful probe closes the breaker.
        tokio::time::sleep(Duration::from_millis(450)).await;
        adapter.recover();
        let reply = service.generate("mB", "q", "initial", &options).await.unwrap();
        assert!(!reply.content.is_empty());
        let breaker = breakers.get_or_create("llm:mB");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn mock_fallback_is_tagged() {
        let mut config = fast_config();
        config.enable_mock_fallback = true;
        let (registry, service) = service_with(config);
        register_mock(
            &registry,
            MockAdapter::failing_with("mA", ErrorKind::ProviderUnavailable),
            1.0,
        );

        let reply = service
            .generate("mA", "q", "initial", &GenerationOptions::uncached())
            .await
            .unwrap();
        assert!(reply.mock_fallback);
        assert_eq!(reply.served_by, "mock-fallback");
    }

    #[tokio::test]
    async fn stream_cascade_records_into_cache() {
        let (registry, service) = service_with(fast_config());
        let adapter = register_mock(&registry, MockAdapter::new("mA"), 1.0);
        let options = GenerationOptions::default();

        let live = service
            .stream_generate("mA", "describe the system", "initial", &options)
            .await
            .unwrap();
        assert!(!live.cached);
        let mut streamed = String::new();
        let mut chunks = live.chunks;
        while let Some(chunk) = chunks.next().await {
            streamed.push_str(&chunk.unwrap());
        }
        assert_eq!(adapter.call_count(), 1);

        // The replay is a single chunk equal to the aggregate.
        let replay = service
            .stream_generate("mA", "describe the system", "initial", &options)
            .await
            .unwrap();
        assert!(replay.cached);
        let mut replayed = String::new();
        let mut chunks = replay.chunks;
        while let Some(chunk) = chunks.next().await {
            replayed.push_str(&chunk.unwrap());
        }
        assert_eq!(replayed, streamed);
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_model_without_fallback_is_an_error() {
        let (_registry, service) = service_with(fast_config());
        let err = service
            .generate("ghost", "q", "initial", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn backoff_delay_within_bounds() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        let jitter = Duration::from_millis(50);
        for attempt in 0..5u32 {
            let floor = base * 2u32.pow(attempt);
            for _ in 0..20 {
                let delay = backoff_delay(attempt, base, max, jitter);
                assert!(delay >= floor.min(max));
                assert!(delay <= (floor + jitter).min(max));
            }
        }
        // The cap wins for large attempts.
        assert_eq!(
            backoff_delay(20, base, max, Duration::ZERO),
            max
        );
    }
}
