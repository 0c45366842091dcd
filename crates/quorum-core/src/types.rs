// crates/quorum-core/src/types.rs

//! Request/response types shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for a single generation call.
///
/// Unset fields fall back to the defaults carried by the model's
/// [`crate::config::ModelConfig`]. The `stream` flag never participates in
/// cache fingerprints, so streamed and plain calls share cache entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Per-call deadline; the effective deadline is the minimum of this and
    /// the model's configured timeout
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Bypass the response cache for this call
    pub skip_cache: bool,
    /// Override the cache TTL for this call
    #[serde(skip)]
    pub cache_ttl: Option<Duration>,
}

impl GenerationOptions {
    /// Options that bypass the response cache.
    pub fn uncached() -> Self {
        Self {
            skip_cache: true,
            ..Default::default()
        }
    }

    /// The option fields that participate in cache fingerprints, in a
    /// stable order. `timeout` and `skip_cache` are transport concerns and
    /// are excluded.
    pub fn fingerprint_fields(&self) -> Vec<(String, serde_json::Value)> {
        let mut fields = Vec::new();
        if let Some(max_tokens) = self.max_tokens {
            fields.push(("max_tokens".to_string(), serde_json::json!(max_tokens)));
        }
        if let Some(temperature) = self.temperature {
            fields.push(("temperature".to_string(), serde_json::json!(temperature)));
        }
        fields
    }
}

/// Quality metrics for a model response.
///
/// All scores are in `[0, 1]`. Produced by the quality evaluator; a zeroed
/// value means the response was not evaluated (or the evaluator was
/// unavailable).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Clear and logical flow
    pub coherence: f64,
    /// Detailed technical insight
    pub technical_depth: f64,
    /// Actionable strategic insight
    pub strategic_value: f64,
    /// Novelty of perspective
    pub uniqueness: f64,
}

impl QualityMetrics {
    pub fn new(coherence: f64, technical_depth: f64, strategic_value: f64, uniqueness: f64) -> Self {
        Self {
            coherence: coherence.clamp(0.0, 1.0),
            technical_depth: technical_depth.clamp(0.0, 1.0),
            strategic_value: strategic_value.clamp(0.0, 1.0),
            uniqueness: uniqueness.clamp(0.0, 1.0),
        }
    }

    /// Average of the four scores.
    pub fn average(&self) -> f64 {
        (self.coherence + self.technical_depth + self.strategic_value + self.uniqueness) / 4.0
    }

    /// Whether the metrics carry any signal at all.
    pub fn is_scored(&self) -> bool {
        self.average() > 0.0
    }
}

/// Token usage as reported by a provider, when available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Approximate token count for text with no provider-reported usage.
///
/// Uses the usual heuristic of ~0.75 words per token.
pub fn approximate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count() as f64;
    (words / 0.75).round() as u32
}

/// One adapter's answer for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Adapter id that produced the answer
    pub model: String,
    /// Generated text
    pub content: String,
    /// The exact prompt sent, post-templating
    pub prompt: String,
    /// Wall-clock creation time
    pub timestamp: DateTime<Utc>,
    /// Provider-reported when available, otherwise approximated from words
    pub tokens_used: u32,
    /// Quality scores; zeroed when not evaluated
    pub quality: QualityMetrics,
    /// Observed call duration
    pub latency_ms: u64,
}

impl ModelResponse {
    pub fn new(model: impl Into<String>, content: impl Into<String>, prompt: impl Into<String>) -> Self {
        let content = content.into();
        let tokens_used = approximate_tokens(&content);
        Self {
            model: model.into(),
            content,
            prompt: prompt.into(),
            timestamp: Utc::now(),
            tokens_used,
            quality: QualityMetrics::default(),
            latency_ms: 0,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        if usage.total_tokens > 0 {
            self.tokens_used = usage.total_tokens;
        }
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_average() {
        let q = QualityMetrics::new(1.0, 0.5, 0.5, 0.0);
        assert!((q.average() - 0.5).abs() < f64::EPSILON);
        assert!(q.is_scored());
        assert!(!QualityMetrics::default().is_scored());
    }

    #[test]
    fn quality_scores_clamped() {
        let q = QualityMetrics::new(1.5, -0.2, 0.3, 2.0);
        assert_eq!(q.coherence, 1.0);
        assert_eq!(q.technical_depth, 0.0);
        assert_eq!(q.uniqueness, 1.0);
    }

    #[test]
    fn token_approximation_from_words() {
        // 3 words / 0.75 = 4 tokens
        assert_eq!(approximate_tokens("one two three"), 4);
        assert_eq!(approximate_tokens(""), 0);
    }

    #[test]
    fn response_prefers_reported_usage() {
        let response = ModelResponse::new("m", "one two three", "p").with_usage(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
        });
        assert_eq!(response.tokens_used, 30);

        let unreported = ModelResponse::new("m", "one two three", "p").with_usage(TokenUsage::default());
        assert_eq!(unreported.tokens_used, 4);
    }

    #[test]
    fn fingerprint_fields_exclude_transport_options() {
        let options = GenerationOptions {
            max_tokens: Some(128),
            temperature: Some(0.7),
            timeout: Some(Duration::from_secs(5)),
            skip_cache: true,
            cache_ttl: None,
        };
        let fields = options.fingerprint_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].0, "max_tokens");
        assert_eq!(fields[1].0, "temperature");
    }
}
