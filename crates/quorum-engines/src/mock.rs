// crates/quorum-engines/src/mock.rs

//! Deterministic mock adapter.
//!
//! Used in tests and as the last-resort fallback responder. The RNG is
//! seeded from a hash of the prompt, so identical inputs always yield
//! identical outputs, including the simulated-failure decision.

use crate::adapter::{Capabilities, ChunkStream, LlmAdapter, RateGate};
use async_trait::async_trait;
use quorum_core::config::ProviderKind;
use quorum_core::error::{ErrorKind, ProviderError, ProviderResult};
use quorum_core::types::GenerationOptions;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const TOPIC_WORDS: &[&str] = &[
    "architecture",
    "trade-offs",
    "latency",
    "throughput",
    "resilience",
    "observability",
    "scalability",
    "consistency",
    "cost",
    "maintainability",
];

pub struct MockAdapter {
    id: String,
    fixed_response: Option<String>,
    failure_probability: f64,
    failure_kind: ErrorKind,
    fail_always: AtomicBool,
    latency: Option<Duration>,
    gate: RateGate,
    calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fixed_response: None,
            failure_probability: 0.0,
            failure_kind: ErrorKind::ProviderUnavailable,
            fail_always: AtomicBool::new(false),
            latency: None,
            gate: RateGate::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with this exact string.
    pub fn with_response(id: impl Into<String>, response: impl Into<String>) -> Self {
        let mut adapter = Self::new(id);
        adapter.fixed_response = Some(response.into());
        adapter
    }

    /// Fail every call with the given kind.
    pub fn failing_with(id: impl Into<String>, kind: ErrorKind) -> Self {
        let mut adapter = Self::new(id);
        adapter.fail_always = AtomicBool::new(true);
        adapter.failure_kind = kind;
        adapter
    }

    /// Simulated failure probability in `[0, 1]`; the decision is drawn from
    /// the prompt-seeded RNG and is therefore deterministic per prompt.
    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_rate_limit(mut self, interval: Duration) -> Self {
        self.gate = RateGate::new(interval);
        self
    }

    /// Stop failing unconditionally; lets tests drive breaker recovery
    /// probes through a shared handle.
    pub fn recover(&self) {
        self.fail_always.store(false, Ordering::SeqCst);
    }

    /// How many times `generate`/`stream_generate` reached the responder.
    /// Cache hits never do.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seed_for(prompt: &str) -> u64 {
        let digest = Sha256::digest(prompt.as_bytes());
        u64::from_le_bytes(digest[..8].try_into().unwrap_or([0; 8]))
    }

    fn respond(&self, prompt: &str) -> ProviderResult<String> {
        let mut rng = StdRng::seed_from_u64(Self::seed_for(prompt));

        if self.fail_always.load(Ordering::SeqCst)
            || (self.failure_probability > 0.0 && rng.gen::<f64>() < self.failure_probability)
        {
            return Err(ProviderError::new(self.failure_kind, "simulated failure")
                .with_provider("mock")
                .with_model(&self.id));
        }

        if let Some(fixed) = &self.fixed_response {
            return Ok(fixed.clone());
        }

        let lowered = prompt.to_ascii_lowercase();
        let response = if lowered.contains("list") {
            Self::list_response(&mut rng)
        } else if lowered.contains("explain") || lowered.contains("how") {
            Self::explanation_response(&mut rng)
        } else if lowered.contains("code") || lowered.contains("function") {
            Self::code_response()
        } else if prompt.trim_end().ends_with('?') {
            Self::question_response(&mut rng)
        } else {
            Self::generic_response(&mut rng)
        };
        Ok(response)
    }

    fn pick(rng: &mut StdRng) -> &'static str {
        TOPIC_WORDS[rng.gen_range(0..TOPIC_WORDS.len())]
    }

    fn list_response(rng: &mut StdRng) -> String {
        let count = rng.gen_range(3..=5);
        let mut lines = vec!["Key points to consider:".to_string()];
        for i in 1..=count {
            lines.push(format!("{}. Weigh the {} implications carefully.", i, Self::pick(rng)));
        }
        lines.join("\n")
    }

    fn explanation_response(rng: &mut StdRng) -> String {
        format!(
            "At a high level this comes down to {}. The dominant factor is {}, \
             which interacts with {} in ways that only surface under load. \
             Start with the simplest design that keeps {} measurable.",
            Self::pick(rng),
            Self::pick(rng),
            Self::pick(rng),
            Self::pick(rng),
        )
    }

    fn code_response() -> String {
        concat!(
            "```rust\n",
            "fn demonstrate(input: &str) -> String {\n",
            "    input.split_whitespace().rev().collect::<Vec<_>>().join(\" \")\n",
            "}\n",
            "```\n",
            "This reverses the word order of the input.",
        )
        .to_string()
    }

    fn question_response(rng: &mut StdRng) -> String {
        format!(
            "Short answer: it depends on {}. If {} is the binding constraint, \
             the usual recommendation holds; otherwise optimise for {} first.",
            Self::pick(rng),
            Self::pick(rng),
            Self::pick(rng),
        )
    }

    fn generic_response(rng: &mut StdRng) -> String {
        format!(
            "Considering the request, the most defensible position balances {} \
             against {}. A staged rollout keeps {} risks contained while the \
             open questions around {} get resolved.",
            Self::pick(rng),
            Self::pick(rng),
            Self::pick(rng),
            Self::pick(rng),
        )
    }
}

#[async_trait]
impl LlmAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> ProviderResult<String> {
        self.gate.wait().await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.respond(prompt)
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> ProviderResult<ChunkStream> {
        let content = self.generate(prompt, options).await?;

        // Chunk on word boundaries so the aggregate equals the full answer.
        let mut chunks = Vec::new();
        let mut current = String::new();
        for word in content.split_inclusive(char::is_whitespace) {
            current.push_str(word);
            if current.len() >= 24 {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        Ok(Box::pin(futures::stream::iter(
            chunks.into_iter().map(Ok::<String, ProviderError>),
        )))
    }

    async fn get_embedding(&self, text: &str) -> ProviderResult<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(Self::seed_for(text));
        Ok((0..8).map(|_| rng.gen_range(-1.0..1.0)).collect())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "mock".to_string(),
            supports_streaming: true,
            supports_embeddings: true,
            supports_vision: false,
            max_tokens: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn identical_prompts_yield_identical_outputs() {
        let adapter = MockAdapter::new("m");
        let options = GenerationOptions::default();
        let first = adapter.generate("explain the design", &options).await.unwrap();
        let second = adapter.generate("explain the design", &options).await.unwrap();
        assert_eq!(first, second);

        let other = adapter.generate("explain the other design", &options).await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn keyword_families() {
        let adapter = MockAdapter::new("m");
        let options = GenerationOptions::default();

        let listy = adapter.generate("list the concerns", &options).await.unwrap();
        assert!(listy.contains("1."));

        let code = adapter.generate("write a function for this", &options).await.unwrap();
        assert!(code.contains("```rust"));

        let question = adapter.generate("is this safe?", &options).await.unwrap();
        assert!(question.starts_with("Short answer"));
    }

    #[tokio::test]
    async fn stream_aggregates_to_generate_output() {
        let adapter = MockAdapter::new("m");
        let options = GenerationOptions::default();
        let full = adapter.generate("describe the system", &options).await.unwrap();

        let mut stream = adapter.stream_generate("describe the system", &options).await.unwrap();
        let mut collected = String::new();
        let mut chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk.unwrap());
            chunks += 1;
        }
        assert_eq!(collected, full);
        assert!(chunks > 1);
    }

    #[tokio::test]
    async fn failure_configuration() {
        let failing = MockAdapter::failing_with("m", ErrorKind::ProviderUnavailable);
        let err = failing
            .generate("anything", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderUnavailable);
        assert!(err.is_retryable());

        // Deterministic per prompt: either always fails or never does.
        let flaky = MockAdapter::new("m").with_failure_probability(0.5);
        let options = GenerationOptions::default();
        let first = flaky.generate("prompt under test", &options).await.is_err();
        for _ in 0..5 {
            assert_eq!(flaky.generate("prompt under test", &options).await.is_err(), first);
        }
    }

    #[tokio::test]
    async fn call_counter_tracks_invocations() {
        let adapter = MockAdapter::with_response("m", "pong");
        let options = GenerationOptions::default();
        assert_eq!(adapter.call_count(), 0);
        adapter.generate("ping", &options).await.unwrap();
        adapter.generate("ping", &options).await.unwrap();
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn embeddings_are_deterministic() {
        let adapter = MockAdapter::new("m");
        let a = adapter.get_embedding("text").await.unwrap();
        let b = adapter.get_embedding("text").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }
}
