//! End-to-end orchestration scenarios on mock adapters.

use async_trait::async_trait;
use futures_util::StreamExt;
use quorum_core::config::{ModelConfig, OrchestratorConfig, ProviderKind};
use quorum_core::error::ProviderResult;
use quorum_core::types::GenerationOptions;
use quorum_engines::mock::MockAdapter;
use quorum_engines::{Capabilities, LlmAdapter};
use quorum_orchestrator::resource::ResourceMetrics;
use quorum_orchestrator::{
    ExecutionStrategy, Orchestrator, OrchestrationRequest, ProgressStatus,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed-response adapter that records every prompt it receives.
struct RecordingAdapter {
    id: String,
    response: String,
    prompts: Mutex<Vec<String>>,
}

impl RecordingAdapter {
    fn new(id: &str, response: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            response: response.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmAdapter for RecordingAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> ProviderResult<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.response.clone())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "mock".to_string(),
            supports_streaming: false,
            supports_embeddings: false,
            supports_vision: false,
            max_tokens: 4096,
        }
    }
}

fn mock_config(id: &str, weight: f64) -> ModelConfig {
    ModelConfig::new(ProviderKind::Mock, id).with_weight(weight)
}

#[tokio::test]
async fn happy_path_gut_pattern() {
    let engine = Orchestrator::with_defaults();
    engine
        .register_adapter(mock_config("mA", 1.0), Arc::new(MockAdapter::with_response("mA", "pong")))
        .unwrap();

    let request = OrchestrationRequest::new("ping")
        .with_pattern("gut")
        .with_models(vec!["mA".to_string()]);
    let result = engine.process(&request).await.unwrap();

    assert_eq!(result.pattern, "gut");
    assert_eq!(result.original_prompt, "ping");
    let initial = result.stage("initial").unwrap();
    assert_eq!(initial.responses["mA"], "pong");
    assert!(initial.error.is_none());

    let progress = result.progress.stage("initial").unwrap();
    assert_eq!(progress.models["mA"], ProgressStatus::Completed);
    assert_eq!(result.progress.overall, ProgressStatus::Completed);
}

#[tokio::test]
async fn every_declared_stage_appears_in_order() {
    let engine = Orchestrator::with_defaults();
    engine
        .register_adapter(mock_config("mA", 2.0), Arc::new(MockAdapter::new("mA")))
        .unwrap();
    engine
        .register_adapter(mock_config("mB", 1.0), Arc::new(MockAdapter::new("mB")))
        .unwrap();

    let request = OrchestrationRequest::new("compare rust async runtimes").with_pattern("perspective");
    let result = engine.process(&request).await.unwrap();

    let stages: Vec<&str> = result.stages.iter().map(|stage| stage.stage.as_str()).collect();
    assert_eq!(stages, vec!["initial", "meta", "hyper"]);

    // Every selected model shows up in every stage's responses or errors.
    for stage in &result.stages {
        for model in ["mA", "mB"] {
            assert!(
                stage.responses.contains_key(model) || stage.errors.contains_key(model),
                "{} missing from stage {}",
                model,
                stage.stage
            );
        }
    }
}

#[tokio::test]
async fn confidence_meta_stage_cross_pollinates_answers() {
    let engine = Orchestrator::with_defaults();
    let rec_a = RecordingAdapter::new("mA", "alpha-insight");
    let rec_b = RecordingAdapter::new("mB", "bravo-insight");
    engine.register_adapter(mock_config("mA", 2.0), rec_a.clone()).unwrap();
    engine.register_adapter(mock_config("mB", 1.0), rec_b.clone()).unwrap();

    let request = OrchestrationRequest::new("evaluate this design").with_pattern("confidence");
    let result = engine.process(&request).await.unwrap();
    assert!(result.stage("meta").unwrap().error.is_none());

    // Each model's meta prompt carries the other model's initial answer and
    // its own, separately.
    let meta_prompt_a = rec_a.prompts().into_iter().nth(1).unwrap();
    assert!(meta_prompt_a.contains("bravo-insight"));
    assert!(meta_prompt_a.contains("alpha-insight"));
    assert!(meta_prompt_a.contains("Model mB:"));
    assert!(!meta_prompt_a.contains("Model mA:"));

    let meta_prompt_b = rec_b.prompts().into_iter().nth(1).unwrap();
    assert!(meta_prompt_b.contains("alpha-insight"));
    assert!(meta_prompt_b.contains("Model mA:"));
}

#[tokio::test]
async fn rerun_is_served_from_cache_without_adapter_calls() {
    let engine = Orchestrator::with_defaults();
    let adapter = Arc::new(MockAdapter::with_response("mA", "ok"));
    engine.register_adapter(mock_config("mA", 1.0), adapter.clone()).unwrap();

    let request = OrchestrationRequest::new("q").with_pattern("gut");
    let first = engine.process(&request).await.unwrap();
    assert!(!first.stage("initial").unwrap().metadata["mA"].cached);
    assert_eq!(adapter.call_count(), 1);

    let second = engine.process(&request).await.unwrap();
    let meta = &second.stage("initial").unwrap().metadata["mA"];
    assert!(meta.cached);
    assert_eq!(second.stage("initial").unwrap().responses["mA"], "ok");
    assert_eq!(adapter.call_count(), 1);

    // Opting out of the cache reaches the adapter again.
    let mut uncached = request.clone();
    uncached.skip_cache = true;
    engine.process(&uncached).await.unwrap();
    assert_eq!(adapter.call_count(), 2);
}

#[tokio::test]
async fn wholly_failed_gut_stage_is_reported_in_result() {
    let engine = Orchestrator::new(OrchestratorConfig {
        retry_base_delay: Duration::from_millis(1),
        retry_jitter: Duration::from_millis(1),
        ..Default::default()
    });
    let adapter = Arc::new(MockAdapter::failing_with(
        "mA",
        quorum_core::error::ErrorKind::ProviderUnavailable,
    ));
    engine.register_adapter(mock_config("mA", 1.0), adapter).unwrap();

    let request = OrchestrationRequest::new("q").with_pattern("gut");
    let result = engine.process(&request).await.unwrap();

    let initial = result.stage("initial").unwrap();
    assert!(initial.responses.is_empty());
    assert!(initial.error.as_deref().unwrap().contains("no successful responses"));
    assert!(initial.errors.contains_key("mA"));
    assert_eq!(result.progress.overall, ProgressStatus::Failed);
}

#[tokio::test]
async fn failed_initial_stage_required_later_surfaces_internal() {
    let engine = Orchestrator::new(OrchestratorConfig {
        retry_base_delay: Duration::from_millis(1),
        retry_jitter: Duration::from_millis(1),
        ..Default::default()
    });
    let adapter = Arc::new(MockAdapter::failing_with(
        "mA",
        quorum_core::error::ErrorKind::ProviderUnavailable,
    ));
    engine.register_adapter(mock_config("mA", 1.0), adapter).unwrap();

    let request = OrchestrationRequest::new("q").with_pattern("confidence");
    let err = engine.process(&request).await.unwrap_err();
    assert_eq!(err.kind, quorum_core::error::ErrorKind::Internal);
}

#[tokio::test]
async fn streamed_first_stage_aggregates_to_the_full_answer() {
    let engine = Orchestrator::with_defaults();
    let adapter = Arc::new(MockAdapter::new("mA"));
    engine.register_adapter(mock_config("mA", 1.0), adapter.clone()).unwrap();

    let full = adapter
        .generate("describe the architecture", &GenerationOptions::default())
        .await
        .unwrap();

    let request = OrchestrationRequest::new("describe the architecture").with_pattern("gut");
    let updates: Vec<_> = engine.stream_process(request).collect().await;

    let streamed: String = updates
        .iter()
        .filter(|update| !update.done)
        .map(|update| update.content.as_str())
        .collect();
    assert_eq!(streamed, full);

    let last = updates.last().unwrap();
    assert!(last.done);
    assert_eq!(last.stage, "summary");
    assert_eq!(last.progress, 100);
    assert!(updates.iter().all(|update| update.pattern == "gut"));
}

#[tokio::test]
async fn fast_analysis_mode_uses_only_the_best_model() {
    let engine = Orchestrator::with_defaults();
    let strong = Arc::new(MockAdapter::with_response("strong", "top answer"));
    let weak = Arc::new(MockAdapter::with_response("weak", "meh"));
    engine.register_adapter(mock_config("strong", 5.0), strong.clone()).unwrap();
    engine.register_adapter(mock_config("weak", 1.0), weak.clone()).unwrap();

    let result = engine
        .process_with_analysis_mode("summarize this", "fast")
        .await
        .unwrap();

    let initial = result.stage("initial").unwrap();
    assert_eq!(initial.responses.len(), 1);
    assert_eq!(initial.responses["strong"], "top answer");
    assert_eq!(weak.call_count(), 0);
}

#[tokio::test]
async fn speed_strategy_stops_after_first_success() {
    let engine = Orchestrator::with_defaults();
    engine
        .register_adapter(mock_config("mA", 2.0), Arc::new(MockAdapter::with_response("mA", "a")))
        .unwrap();
    engine
        .register_adapter(mock_config("mB", 1.0), Arc::new(MockAdapter::with_response("mB", "b")))
        .unwrap();

    let result = engine
        .process_with_strategy("quick question", ExecutionStrategy::SpeedOptimised)
        .await
        .unwrap();

    let initial = result.stage("initial").unwrap();
    assert_eq!(initial.responses.len(), 1);
    assert_eq!(initial.errors.len(), 1);
    assert!(initial
        .errors
        .values()
        .all(|reason| reason.contains("cancelled") || reason.contains("skipped")));
}

#[tokio::test]
async fn quick_analyze_returns_the_best_final_answer() {
    let engine = Orchestrator::with_defaults();
    engine
        .register_adapter(
            mock_config("lead", 5.0),
            Arc::new(MockAdapter::with_response("lead", "the synthesis")),
        )
        .unwrap();
    engine
        .register_adapter(
            mock_config("aux", 1.0),
            Arc::new(MockAdapter::with_response("aux", "a footnote")),
        )
        .unwrap();

    let answer = engine.quick_analyze("what should we do", "comparative").await.unwrap();
    assert_eq!(answer, "the synthesis");

    let err = engine.quick_analyze("what should we do", "bogus").await.unwrap_err();
    assert_eq!(err.kind, quorum_core::error::ErrorKind::BadRequest);
}

#[tokio::test]
async fn compare_analyses_reports_per_type_metrics() {
    let engine = Orchestrator::with_defaults();
    engine
        .register_adapter(mock_config("mA", 1.0), Arc::new(MockAdapter::new("mA")))
        .unwrap();

    let comparison = engine
        .compare_analyses(
            "compare things",
            &["gut".to_string(), "confidence".to_string(), "bogus".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(comparison["gut"]["stages"], 1);
    assert_eq!(comparison["confidence"]["stages"], 2);
    assert!(comparison["gut"]["responses"].as_u64().unwrap() >= 1);
    assert!(comparison["bogus"]["error"].is_string());
}

#[tokio::test]
async fn optimizer_pressure_shrinks_the_dispatch_width() {
    let engine = Orchestrator::with_defaults();
    engine
        .register_adapter(mock_config("mA", 1.0), Arc::new(MockAdapter::with_response("mA", "ok")))
        .unwrap();

    let before = engine.optimizer().current_concurrency();
    engine.optimizer().ingest_sample(ResourceMetrics::synthetic(96.0, 40.0));
    engine.optimizer().ingest_sample(ResourceMetrics::synthetic(96.0, 40.0));
    assert_eq!(engine.optimizer().current_concurrency(), before - 1);

    // Processing still works at the reduced width.
    let request = OrchestrationRequest::new("q").with_pattern("gut");
    let result = engine.process(&request).await.unwrap();
    assert_eq!(result.stage("initial").unwrap().responses["mA"], "ok");
}

#[tokio::test]
async fn provider_status_reflects_registrations() {
    let engine = Orchestrator::with_defaults();
    engine
        .register_adapter(mock_config("mA", 1.5), Arc::new(MockAdapter::new("mA")))
        .unwrap();

    let status = engine.fallback().provider_status();
    assert!(status["mA"].available);
    assert_eq!(status["mA"].provider, "mock");
    assert_eq!(status["mA"].weight, 1.5);
}
