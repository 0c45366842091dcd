// crates/quorum-orchestrator/src/evaluator.rs

//! Response quality scoring.
//!
//! A designated evaluator model (an OpenAI-family model when one is
//! registered, else the highest-priority available model) is prompted with a
//! fixed critique template demanding JSON scores. Anything unparseable, and
//! any evaluator failure, yields zeroed metrics; quality scoring never
//! fails the enclosing request. The evaluator runs behind its own breaker
//! keyed `quality_eval_<model>`.

use log::{debug, warn};
use quorum_core::config::ProviderKind;
use quorum_core::types::{GenerationOptions, ModelResponse, QualityMetrics};
use quorum_engines::circuit_breaker::CircuitBreakerRegistry;
use quorum_engines::registry::{AdapterRegistry, Registration};
use quorum_engines::LlmAdapter;
use serde_json::Value;
use std::sync::Arc;

const CRITIQUE_TEMPLATE: &str = "\
Evaluate the response below on a scale of 0 to 1 for each of:
1. coherence: clear and logical flow
2. technical_depth: detailed technical insight
3. strategic_value: actionable strategic insight
4. uniqueness: novel perspective

Response to evaluate:
{response}

Return only a JSON object of the form
{\"coherence\": 0.0, \"technical_depth\": 0.0, \"strategic_value\": 0.0, \"uniqueness\": 0.0}";

pub struct QualityEvaluator {
    registry: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl QualityEvaluator {
    pub fn new(registry: Arc<AdapterRegistry>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { registry, breakers }
    }

    /// Prefer an OpenAI-family model; otherwise the first available model in
    /// priority order. A response is never scored by itself when an
    /// alternative exists.
    fn pick_evaluator(&self, subject_model: &str) -> Option<Registration> {
        let ordered = self.registry.prioritized(None);

        let openai = ordered.iter().find_map(|id| {
            let registration = self.registry.get(id)?;
            (registration.config.provider == ProviderKind::OpenAi
                && registration.adapter.is_available())
            .then_some(registration)
        });
        if let Some(found) = openai {
            return Some(found);
        }

        let mut fallback = None;
        for id in &ordered {
            let Some(registration) = self.registry.get(id) else {
                continue;
            };
            if !registration.adapter.is_available() {
                continue;
            }
            if id.as_str() != subject_model {
                return Some(registration);
            }
            fallback.get_or_insert(registration);
        }
        fallback
    }

    /// Score one response. Returns zeroed metrics when no evaluator is
    /// usable or its output cannot be parsed.
    pub async fn evaluate(&self, response: &ModelResponse) -> QualityMetrics {
        let Some(registration) = self.pick_evaluator(&response.model) else {
            debug!("no evaluator model available, returning zeroed quality");
            return QualityMetrics::default();
        };

        let breaker = self
            .breakers
            .get_or_create(&format!("quality_eval_{}", registration.config.model_id));
        if !breaker.allow_request() {
            debug!(
                "quality evaluator {} circuit open, returning zeroed quality",
                registration.config.model_id
            );
            return QualityMetrics::default();
        }

        let prompt = CRITIQUE_TEMPLATE.replace("{response}", &response.content);
        match registration
            .adapter
            .generate(&prompt, &GenerationOptions::uncached())
            .await
        {
            Ok(text) => {
                breaker.record_success();
                parse_scores(&text)
            }
            Err(error) => {
                warn!(
                    "quality evaluation via {} failed: {}",
                    registration.config.model_id, error
                );
                if error.is_retryable() {
                    breaker.record_failure();
                }
                QualityMetrics::default()
            }
        }
    }
}

/// Pull the first JSON object out of the evaluator's reply and read the four
/// scores, clamped to `[0, 1]`. Zeros on any parse failure.
fn parse_scores(text: &str) -> QualityMetrics {
    let Some(start) = text.find('{') else {
        return QualityMetrics::default();
    };
    let Some(end) = text.rfind('}') else {
        return QualityMetrics::default();
    };
    if end < start {
        return QualityMetrics::default();
    }
    let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) else {
        return QualityMetrics::default();
    };

    let score = |keys: &[&str]| -> f64 {
        keys.iter()
            .find_map(|key| value.get(*key).and_then(Value::as_f64))
            .unwrap_or(0.0)
    };

    QualityMetrics::new(
        score(&["coherence", "coherence_score"]),
        score(&["technical_depth", "technicalDepth"]),
        score(&["strategic_value", "strategicValue"]),
        score(&["uniqueness"]),
    )
}
