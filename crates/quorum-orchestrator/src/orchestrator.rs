// crates/quorum-orchestrator/src/orchestrator.rs

//! The orchestrator core: composes the registry, cache, breakers, fallback
//! service, resource optimiser, and pattern library into multi-stage,
//! multi-model runs.
//!
//! Stages execute strictly in pattern order; within a stage, per-model
//! dispatches run concurrently under a semaphore sized from the resource
//! optimiser. Every dispatch goes through the fallback service, so each call
//! carries the full reliability envelope.

use crate::context::{self, StageContext, StageResponses};
use crate::evaluator::QualityEvaluator;
use crate::patterns::{render_template, Pattern, PatternLibrary};
use crate::progress::{ProgressSnapshot, ProgressStatus, ProgressTracker};
use crate::resource::{OptimizationAction, ResourceOptimizer};
use crate::strategy::{DispatchMode, ExecutionStrategy, StrategyHints, StrategySelector};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use log::{info, warn};
use quorum_core::config::{
    AnalysisMode, ModelConfig, OrchestratorConfig, SelectionStrategy,
};
use quorum_core::error::{ProviderError, ProviderResult};
use quorum_core::types::{GenerationOptions, ModelResponse, QualityMetrics};
use quorum_engines::cache::ResponseCache;
use quorum_engines::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry};
use quorum_engines::fallback::{FallbackConfig, FallbackService, RetryHook};
use quorum_engines::registry::AdapterRegistry;
use quorum_engines::{create_adapter, LlmAdapter};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Transport-agnostic request shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub skip_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl OrchestrationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn with_analysis_mode(mut self, mode: impl Into<String>) -> Self {
        self.analysis_mode = Some(mode.into());
        self
    }
}

/// Per-response bookkeeping surfaced alongside the content.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMeta {
    pub tokens: u32,
    pub latency_ms: u64,
    pub quality: QualityMetrics,
    /// Adapter that actually served the call (may differ after failover)
    pub served_by: String,
    pub cached: bool,
    /// Whether the answer came from the mock last resort
    pub fallback: bool,
}

/// One stage's outputs. Every selected model appears either in `responses`
/// or in `errors`.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: String,
    pub responses: HashMap<String, String>,
    pub metadata: HashMap<String, ResponseMeta>,
    pub errors: HashMap<String, String>,
    /// Set when the stage produced no successful responses at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub pattern: String,
    /// Stage outcomes, in pattern order; no stage is ever skipped
    pub stages: Vec<StageOutcome>,
    pub progress: ProgressSnapshot,
    pub original_prompt: String,
}

impl OrchestrationResult {
    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|outcome| outcome.stage == name)
    }

    /// Last stage that produced at least one response.
    pub fn final_stage(&self) -> Option<&StageOutcome> {
        self.stages.iter().rev().find(|outcome| !outcome.responses.is_empty())
    }
}

/// One element of a streaming run.
#[derive(Debug, Clone, Serialize)]
pub struct StreamUpdate {
    pub model: String,
    pub stage: String,
    pub content: String,
    pub done: bool,
    /// Rough completion percentage, 0..=100
    pub progress: u8,
    pub cached: bool,
    pub pattern: String,
}

/// Cumulative per-model bookkeeping.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelMetrics {
    pub successes: u64,
    pub failures: u64,
    pub tokens_used: u64,
    pub avg_latency_ms: f64,
    pub avg_quality: f64,
    #[serde(skip)]
    quality_samples: u64,
}

#[derive(Default)]
struct StageRun {
    responses: StageResponses,
    metas: HashMap<String, ResponseMeta>,
    errors: HashMap<String, String>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: ResponseCache,
    fallback: Arc<FallbackService>,
    patterns: PatternLibrary,
    optimizer: Arc<ResourceOptimizer>,
    evaluator: QualityEvaluator,
    modes: RwLock<HashMap<String, AnalysisMode>>,
    metrics: Mutex<HashMap<String, ModelMetrics>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let registry = Arc::new(AdapterRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout,
        }));
        let cache = if config.cache_enabled {
            ResponseCache::with_defaults()
        } else {
            ResponseCache::disabled()
        };
        let fallback = Arc::new(FallbackService::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            cache.clone(),
            FallbackConfig::from_orchestrator(&config),
        ));
        let evaluator = QualityEvaluator::new(Arc::clone(&registry), Arc::clone(&breakers));
        let modes = RwLock::new(AnalysisMode::default_modes(&config.default_pattern));

        Self {
            registry,
            breakers,
            cache,
            fallback,
            patterns: PatternLibrary::builtin(),
            optimizer: Arc::new(ResourceOptimizer::with_defaults()),
            evaluator,
            modes,
            metrics: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(OrchestratorConfig::default())
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn fallback(&self) -> &FallbackService {
        &self.fallback
    }

    pub fn optimizer(&self) -> &Arc<ResourceOptimizer> {
        &self.optimizer
    }

    pub fn patterns(&self) -> &PatternLibrary {
        &self.patterns
    }

    /// Resolve and register a backend from its configuration.
    pub fn register_model(&self, config: ModelConfig) -> anyhow::Result<()> {
        let adapter = create_adapter(&config)?;
        self.registry.register(config, adapter)
    }

    /// Register a pre-built adapter (used by tests and embedders).
    pub fn register_adapter(
        &self,
        config: ModelConfig,
        adapter: Arc<dyn LlmAdapter>,
    ) -> anyhow::Result<()> {
        self.registry.register(config, adapter)
    }

    pub fn add_analysis_mode(&self, mode: AnalysisMode) {
        if let Ok(mut modes) = self.modes.write() {
            modes.insert(mode.name.clone(), mode);
        }
    }

    pub fn available_analysis_modes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modes
            .read()
            .map(|modes| modes.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn reset_circuit_breakers(&self) {
        self.breakers.reset_all();
    }

    /// Start resource sampling and wire optimiser actions to the cache.
    /// Returns the background task handles.
    pub fn start_monitoring(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let sampler = self.optimizer.spawn_monitor();
        let mut actions = self.optimizer.subscribe_actions();
        let cache = self.cache.clone();
        let listener = tokio::spawn(async move {
            while let Ok(action) = actions.recv().await {
                if action == OptimizationAction::ClearCache {
                    info!("resource optimiser requested cache clear");
                    cache.clear();
                }
            }
        });
        vec![sampler, listener]
    }

    /// Run the full pattern and return per-stage, per-model outputs.
    pub async fn process(
        &self,
        request: &OrchestrationRequest,
    ) -> ProviderResult<OrchestrationResult> {
        let ResolvedRun {
            pattern,
            models,
            options,
            evaluate_quality,
        } = self.resolve_run(request)?;
        self.run_pattern(
            &request.prompt,
            &pattern,
            models,
            options,
            evaluate_quality,
            DispatchMode::Concurrent { min_responses: None },
        )
        .await
    }

    /// Run a preset analysis mode.
    pub async fn process_with_analysis_mode(
        &self,
        prompt: &str,
        mode: &str,
    ) -> ProviderResult<OrchestrationResult> {
        let request = OrchestrationRequest::new(prompt).with_analysis_mode(mode);
        self.process(&request).await
    }

    /// Run under an execution strategy instead of a named mode.
    pub async fn process_with_strategy(
        &self,
        prompt: &str,
        strategy: ExecutionStrategy,
    ) -> ProviderResult<OrchestrationResult> {
        let load = self.optimizer.current_metrics().map(|metrics| metrics.cpu_percent);
        let plan = StrategySelector::plan(
            strategy,
            &self.registry,
            prompt,
            StrategyHints::default(),
            load,
        );
        let pattern_name = plan
            .pattern
            .unwrap_or_else(|| self.config.default_pattern.clone());
        let pattern = self.lookup_pattern(&pattern_name)?;
        if plan.models.is_empty() {
            return Err(ProviderError::internal("no models available for processing"));
        }
        self.run_pattern(
            prompt,
            &pattern,
            plan.models,
            GenerationOptions::default(),
            plan.evaluate_quality,
            plan.mode,
        )
        .await
    }

    /// Convenience wrapper: run `analysis_type` (a mode name or pattern
    /// name) and return the best single answer of the last stage present,
    /// preferring `ultra`.
    pub async fn quick_analyze(&self, prompt: &str, analysis_type: &str) -> ProviderResult<String> {
        let request = self.request_for_type(prompt, analysis_type)?;
        let result = self.process(&request).await?;
        self.best_response(&result)
            .map(|(_, content)| content)
            .ok_or_else(|| ProviderError::internal("no model produced a response"))
    }

    /// Run several analysis types against one prompt and report comparative
    /// metrics per type.
    pub async fn compare_analyses(
        &self,
        prompt: &str,
        analysis_types: &[String],
    ) -> ProviderResult<serde_json::Value> {
        let mut comparison = serde_json::Map::new();
        for analysis_type in analysis_types {
            let request = match self.request_for_type(prompt, analysis_type) {
                Ok(request) => request,
                Err(error) => {
                    comparison.insert(analysis_type.clone(), json!({ "error": error.to_string() }));
                    continue;
                }
            };
            let started = Instant::now();
            match self.process(&request).await {
                Ok(result) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let responded: usize =
                        result.stages.iter().map(|stage| stage.responses.len()).sum();
                    let tokens: u64 = result
                        .stages
                        .iter()
                        .flat_map(|stage| stage.metadata.values())
                        .map(|meta| meta.tokens as u64)
                        .sum();
                    let scored: Vec<f64> = result
                        .stages
                        .iter()
                        .flat_map(|stage| stage.metadata.values())
                        .map(|meta| meta.quality.average())
                        .filter(|average| *average > 0.0)
                        .collect();
                    let avg_quality = if scored.is_empty() {
                        0.0
                    } else {
                        scored.iter().sum::<f64>() / scored.len() as f64
                    };
                    let best = self.best_response(&result);
                    comparison.insert(
                        analysis_type.clone(),
                        json!({
                            "pattern": result.pattern,
                            "stages": result.stages.len(),
                            "responses": responded,
                            "total_tokens": tokens,
                            "avg_quality": avg_quality,
                            "elapsed_ms": elapsed_ms,
                            "best_model": best.as_ref().map(|(model, _)| model.clone()),
                            "answer_chars": best.map(|(_, content)| content.len()).unwrap_or(0),
                        }),
                    );
                }
                Err(error) => {
                    comparison.insert(analysis_type.clone(), json!({ "error": error.to_string() }));
                }
            }
        }
        Ok(serde_json::Value::Object(comparison))
    }

    /// Stream the first stage of the pattern from the highest-priority
    /// model; later stages run unstreamed and contribute summary updates.
    pub fn stream_process<'a>(
        &'a self,
        request: OrchestrationRequest,
    ) -> Pin<Box<dyn Stream<Item = StreamUpdate> + Send + 'a>> {
        Box::pin(async_stream::stream! {
            let pattern_name = request
                .pattern
                .clone()
                .unwrap_or_else(|| self.config.default_pattern.clone());
            let pattern = match self.lookup_pattern(&pattern_name) {
                Ok(pattern) => pattern,
                Err(error) => {
                    yield summary_update(&pattern_name, format!("error: {}", error));
                    return;
                }
            };
            let models = match self.select_models(request.models.as_deref(), SelectionStrategy::Weighted) {
                Ok(models) => models,
                Err(error) => {
                    yield summary_update(&pattern_name, format!("error: {}", error));
                    return;
                }
            };
            let Some(lead) = models.first().cloned() else {
                yield summary_update(&pattern_name, "error: no models available".to_string());
                return;
            };
            let options = GenerationOptions {
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                timeout: request.deadline_ms.map(Duration::from_millis),
                skip_cache: request.skip_cache,
                cache_ttl: None,
            };

            let first_stage = pattern.stages[0].clone();
            let base = context::base_context(&request.prompt, &[]);
            let template = pattern.template_for(&first_stage).unwrap_or_default().to_string();
            let prompt = render_template(&template, &base);

            let outcome = self
                .fallback
                .stream_generate(&lead, &prompt, &first_stage, &options)
                .await;
            let (mut chunks, cached) = match outcome {
                Ok(stream) => (stream.chunks, stream.cached),
                Err(error) => {
                    yield summary_update(&pattern_name, format!("error: {}", error));
                    return;
                }
            };

            let mut collected = String::new();
            let mut emitted = 0u32;
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(text) => {
                        collected.push_str(&text);
                        emitted += 1;
                        yield StreamUpdate {
                            model: lead.clone(),
                            stage: first_stage.clone(),
                            content: text,
                            done: false,
                            progress: (10 + emitted.min(40) * 2) as u8,
                            cached,
                            pattern: pattern_name.clone(),
                        };
                    }
                    Err(error) => {
                        yield summary_update(&pattern_name, format!("error: {}", error));
                        return;
                    }
                }
            }

            // Later stages are not streamed; each contributes one summary line.
            let mut history: Vec<(String, StageResponses)> = Vec::new();
            let mut first_responses = StageResponses::new();
            first_responses.insert(
                lead.clone(),
                ModelResponse::new(lead.clone(), collected, prompt),
            );
            history.push((first_stage, first_responses));

            let total = pattern.stages.len();
            let tracker = Arc::new(ProgressTracker::new(&pattern.stages));
            for (index, stage) in pattern.stages.iter().enumerate().skip(1) {
                let base = context::base_context(&request.prompt, &history);
                let run = self
                    .run_stage(
                        &pattern,
                        stage,
                        &models,
                        &base,
                        &history,
                        &options,
                        false,
                        &tracker,
                        DispatchMode::Concurrent { min_responses: None },
                    )
                    .await;
                yield StreamUpdate {
                    model: String::new(),
                    stage: stage.clone(),
                    content: format!("{} of {} models responded", run.responses.len(), models.len()),
                    done: false,
                    progress: (90 + (index * 10 / total).min(9)) as u8,
                    cached: false,
                    pattern: pattern_name.clone(),
                };
                history.push((stage.clone(), run.responses));
            }

            yield StreamUpdate {
                model: lead,
                stage: "summary".to_string(),
                content: String::new(),
                done: true,
                progress: 100,
                cached,
                pattern: pattern_name,
            };
        })
    }

    /// Cumulative per-model metrics.
    pub fn metrics(&self) -> HashMap<String, ModelMetrics> {
        self.metrics
            .lock()
            .map(|metrics| metrics.clone())
            .unwrap_or_default()
    }

    pub fn reset_metrics(&self) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.clear();
        }
    }

    /// Best answer of the result: quality average, then registry weight,
    /// then model id.
    pub fn best_response(&self, result: &OrchestrationResult) -> Option<(String, String)> {
        let stage = result
            .stage("ultra")
            .filter(|outcome| !outcome.responses.is_empty())
            .or_else(|| result.final_stage())?;

        let mut entries: Vec<(&String, &String)> = stage.responses.iter().collect();
        entries.sort_by(|a, b| {
            let quality_a = stage
                .metadata
                .get(a.0)
                .map(|meta| meta.quality.average())
                .unwrap_or(0.0);
            let quality_b = stage
                .metadata
                .get(b.0)
                .map(|meta| meta.quality.average())
                .unwrap_or(0.0);
            let weight_a = self
                .registry
                .get(a.0)
                .map(|reg| reg.config.weight)
                .unwrap_or(0.0);
            let weight_b = self
                .registry
                .get(b.0)
                .map(|reg| reg.config.weight)
                .unwrap_or(0.0);
            quality_b
                .partial_cmp(&quality_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    weight_b
                        .partial_cmp(&weight_a)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.0.cmp(b.0))
        });
        entries
            .first()
            .map(|(model, content)| ((*model).clone(), (*content).clone()))
    }

    // Internal plumbing.

    fn lookup_pattern(&self, name: &str) -> ProviderResult<Pattern> {
        self.patterns.get(name).ok_or_else(|| {
            ProviderError::bad_request(format!(
                "unknown pattern: {}. Available patterns: {:?}",
                name,
                self.patterns.names()
            ))
        })
    }

    fn resolve_run(&self, request: &OrchestrationRequest) -> ProviderResult<ResolvedRun> {
        let (pattern_name, selection, evaluate_quality, cache_responses, mode_timeout, mode_models) =
            match &request.analysis_mode {
                Some(name) => {
                    let mode = self
                        .modes
                        .read()
                        .ok()
                        .and_then(|modes| modes.get(name).cloned())
                        .ok_or_else(|| {
                            ProviderError::bad_request(format!(
                                "unknown analysis mode: {}. Available modes: {:?}",
                                name,
                                self.available_analysis_modes()
                            ))
                        })?;
                    (
                        mode.pattern,
                        mode.selection,
                        mode.evaluate_quality,
                        mode.cache_responses,
                        mode.timeout,
                        mode.models,
                    )
                }
                None => (
                    request
                        .pattern
                        .clone()
                        .unwrap_or_else(|| self.config.default_pattern.clone()),
                    SelectionStrategy::Weighted,
                    false,
                    true,
                    None,
                    None,
                ),
            };

        let pattern = self.lookup_pattern(&pattern_name)?;
        let requested = request.models.clone().or(mode_models);
        let models = self.select_models(requested.as_deref(), selection)?;
        if models.is_empty() {
            return Err(ProviderError::internal("no models available for processing"));
        }

        let options = GenerationOptions {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            timeout: request.deadline_ms.map(Duration::from_millis).or(mode_timeout),
            skip_cache: request.skip_cache || !cache_responses,
            cache_ttl: None,
        };

        Ok(ResolvedRun {
            pattern,
            models,
            options,
            evaluate_quality,
        })
    }

    fn request_for_type(
        &self,
        prompt: &str,
        analysis_type: &str,
    ) -> ProviderResult<OrchestrationRequest> {
        let is_mode = self
            .modes
            .read()
            .map(|modes| modes.contains_key(analysis_type))
            .unwrap_or(false);
        if is_mode {
            Ok(OrchestrationRequest::new(prompt).with_analysis_mode(analysis_type))
        } else if self.patterns.get(analysis_type).is_some() {
            Ok(OrchestrationRequest::new(prompt).with_pattern(analysis_type))
        } else {
            Err(ProviderError::bad_request(format!(
                "unknown analysis type: {}",
                analysis_type
            )))
        }
    }

    /// Apply a selection strategy, or validate an explicit model list.
    /// Orderings are deterministic: weight descending, alphabetical ties.
    fn select_models(
        &self,
        requested: Option<&[String]>,
        selection: SelectionStrategy,
    ) -> ProviderResult<Vec<String>> {
        if let Some(requested) = requested {
            let invalid: Vec<String> = requested
                .iter()
                .filter(|id| !self.registry.contains(id))
                .cloned()
                .collect();
            if !invalid.is_empty() {
                return Err(ProviderError::bad_request(format!(
                    "invalid model(s) specified: {:?}",
                    invalid
                )));
            }
            return Ok(self.registry.prioritized(Some(requested)));
        }

        let available = self.registry.available();
        if available.is_empty() {
            return Err(ProviderError::internal("no models available for processing"));
        }

        let ordered = self.registry.prioritized(Some(&available));
        Ok(match selection {
            SelectionStrategy::All | SelectionStrategy::Weighted => ordered,
            SelectionStrategy::Best => {
                let k = self.config.max_workers.unwrap_or(1).max(1);
                ordered.into_iter().take(k).collect()
            }
            SelectionStrategy::Random => {
                let k = self.config.max_workers.unwrap_or(available.len()).max(1);
                let mut chosen: Vec<String> = ordered
                    .choose_multiple(&mut rand::thread_rng(), k)
                    .cloned()
                    .collect();
                chosen.sort();
                chosen
            }
        })
    }

    async fn run_pattern(
        &self,
        prompt: &str,
        pattern: &Pattern,
        models: Vec<String>,
        options: GenerationOptions,
        evaluate_quality: bool,
        mode: DispatchMode,
    ) -> ProviderResult<OrchestrationResult> {
        info!(
            "running pattern '{}' over {:?} ({} stages)",
            pattern.name,
            models,
            pattern.stages.len()
        );
        let tracker = Arc::new(ProgressTracker::new(&pattern.stages));
        let mut history: Vec<(String, StageResponses)> = Vec::new();
        let mut outcomes: Vec<StageOutcome> = Vec::new();

        for stage in &pattern.stages {
            let base = context::base_context(prompt, &history);
            let run = self
                .run_stage(
                    pattern,
                    stage,
                    &models,
                    &base,
                    &history,
                    &options,
                    evaluate_quality,
                    &tracker,
                    mode,
                )
                .await;

            let stage_error = if run.responses.is_empty() {
                let mut reasons: Vec<String> = run
                    .errors
                    .iter()
                    .map(|(model, reason)| format!("{}: {}", model, reason))
                    .collect();
                reasons.sort();
                Some(format!("no successful responses ({})", reasons.join("; ")))
            } else {
                None
            };
            if let Some(reason) = &stage_error {
                warn!("stage {} failed entirely: {}", stage, reason);
            }

            outcomes.push(StageOutcome {
                stage: stage.clone(),
                responses: run
                    .responses
                    .iter()
                    .map(|(model, response)| (model.clone(), response.content.clone()))
                    .collect(),
                metadata: run.metas,
                errors: run.errors,
                error: stage_error,
            });
            history.push((stage.clone(), run.responses));
        }

        // A wholly failed stage that a later stage's template substitutes
        // from invalidates the whole run.
        for (index, outcome) in outcomes.iter().enumerate() {
            if outcome.error.is_some() && stage_required_later(pattern, index) {
                return Err(ProviderError::internal(format!(
                    "stage {} produced no responses but a later stage depends on it ({})",
                    outcome.stage,
                    outcome.error.as_deref().unwrap_or("unknown"),
                )));
            }
        }

        Ok(OrchestrationResult {
            pattern: pattern.name.clone(),
            stages: outcomes,
            progress: tracker.snapshot(),
            original_prompt: prompt.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        pattern: &Pattern,
        stage: &str,
        models: &[String],
        base: &StageContext,
        history: &[(String, StageResponses)],
        options: &GenerationOptions,
        evaluate_quality: bool,
        tracker: &Arc<ProgressTracker>,
        mode: DispatchMode,
    ) -> StageRun {
        let template = pattern.template_for(stage).unwrap_or_default().to_string();
        let mut run = StageRun::default();

        match mode {
            DispatchMode::Sequential => {
                for (index, model) in models.iter().enumerate() {
                    let personal = context::personalize(base, model, history);
                    let prompt = render_template(&template, &personal);
                    tracker.update(model, stage, ProgressStatus::Pending, None);

                    let (_, outcome) = self
                        .call_model(
                            model.clone(),
                            stage.to_string(),
                            prompt,
                            options.clone(),
                            evaluate_quality,
                            Arc::clone(tracker),
                            None,
                        )
                        .await;
                    match outcome {
                        Ok((response, meta)) => {
                            run.metas.insert(model.clone(), meta);
                            run.responses.insert(model.clone(), response);
                            for skipped in &models[index + 1..] {
                                tracker.update(
                                    skipped,
                                    stage,
                                    ProgressStatus::Cancelled,
                                    Some("earlier candidate succeeded".to_string()),
                                );
                                run.errors.insert(
                                    skipped.clone(),
                                    "skipped: earlier candidate succeeded".to_string(),
                                );
                            }
                            break;
                        }
                        Err(error) => {
                            run.errors.insert(model.clone(), error.to_string());
                        }
                    }
                }
            }
            DispatchMode::Concurrent { min_responses } => {
                let width = self
                    .config
                    .max_workers
                    .unwrap_or_else(|| self.optimizer.current_concurrency())
                    .max(1);
                let semaphore = Arc::new(Semaphore::new(width));

                let mut dispatches = FuturesUnordered::new();
                for model in models {
                    let personal = context::personalize(base, model, history);
                    let prompt = render_template(&template, &personal);
                    tracker.update(model, stage, ProgressStatus::Pending, None);
                    dispatches.push(self.call_model(
                        model.clone(),
                        stage.to_string(),
                        prompt,
                        options.clone(),
                        evaluate_quality,
                        Arc::clone(tracker),
                        Some(Arc::clone(&semaphore)),
                    ));
                }

                let mut successes = 0usize;
                while let Some((model, outcome)) = dispatches.next().await {
                    match outcome {
                        Ok((response, meta)) => {
                            successes += 1;
                            run.metas.insert(model.clone(), meta);
                            run.responses.insert(model, response);
                        }
                        Err(error) => {
                            run.errors.insert(model, error.to_string());
                        }
                    }
                    if let Some(min) = min_responses {
                        if successes >= min {
                            break;
                        }
                    }
                }
                // Dropping the unfinished dispatches cancels them.
                drop(dispatches);
                for model in models {
                    if !run.responses.contains_key(model) && !run.errors.contains_key(model) {
                        tracker.update(
                            model,
                            stage,
                            ProgressStatus::Cancelled,
                            Some("enough responses collected".to_string()),
                        );
                        run.errors
                            .insert(model.clone(), "cancelled: enough responses collected".to_string());
                    }
                }
            }
        }
        run
    }

    async fn call_model(
        &self,
        model: String,
        stage: String,
        prompt: String,
        options: GenerationOptions,
        evaluate_quality: bool,
        tracker: Arc<ProgressTracker>,
        semaphore: Option<Arc<Semaphore>>,
    ) -> (String, ProviderResult<(ModelResponse, ResponseMeta)>) {
        let _permit = match semaphore {
            Some(semaphore) => semaphore.acquire_owned().await.ok(),
            None => None,
        };
        tracker.update(&model, &stage, ProgressStatus::Started, None);

        let hook: RetryHook = {
            let tracker = Arc::clone(&tracker);
            let stage = stage.clone();
            Arc::new(move |candidate: &str, attempt: u32| {
                tracker.update(
                    candidate,
                    &stage,
                    ProgressStatus::Retrying,
                    Some(format!("retry attempt {}", attempt)),
                );
            })
        };

        tracker.update(&model, &stage, ProgressStatus::InProgress, None);
        let started = Instant::now();
        let outcome = self
            .fallback
            .generate_with_hook(&model, &prompt, &stage, &options, Some(hook))
            .await;

        match outcome {
            Ok(reply) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let mut response =
                    ModelResponse::new(model.clone(), reply.content, prompt).with_latency(latency_ms);
                if evaluate_quality {
                    response.quality = self.evaluator.evaluate(&response).await;
                }
                let meta = ResponseMeta {
                    tokens: response.tokens_used,
                    latency_ms,
                    quality: response.quality,
                    served_by: reply.served_by,
                    cached: reply.cached,
                    fallback: reply.mock_fallback,
                };
                tracker.update(&model, &stage, ProgressStatus::Completed, None);
                self.record_success(&model, &response);
                (model, Ok((response, meta)))
            }
            Err(error) => {
                tracker.update(
                    &model,
                    &stage,
                    ProgressStatus::Failed,
                    Some(error.to_string()),
                );
                self.record_failure(&model);
                (model, Err(error))
            }
        }
    }

    fn record_success(&self, model: &str, response: &ModelResponse) {
        if !self.config.collect_metrics {
            return;
        }
        if let Ok(mut metrics) = self.metrics.lock() {
            let entry = metrics.entry(model.to_string()).or_default();
            entry.successes += 1;
            entry.tokens_used += response.tokens_used as u64;
            let n = entry.successes as f64;
            entry.avg_latency_ms += (response.latency_ms as f64 - entry.avg_latency_ms) / n;
            if response.quality.is_scored() {
                entry.quality_samples += 1;
                let qn = entry.quality_samples as f64;
                entry.avg_quality += (response.quality.average() - entry.avg_quality) / qn;
            }
        }
    }

    fn record_failure(&self, model: &str) {
        if !self.config.collect_metrics {
            return;
        }
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.entry(model.to_string()).or_default().failures += 1;
        }
    }
}

struct ResolvedRun {
    pattern: Pattern,
    models: Vec<String>,
    options: GenerationOptions,
    evaluate_quality: bool,
}

/// Whether any stage after `index` substitutes from stage `index`'s output.
fn stage_required_later(pattern: &Pattern, index: usize) -> bool {
    let stage = &pattern.stages[index];
    let direct = format!("${{{}_responses}}", stage);
    let personal: &[&str] = match stage.as_str() {
        "initial" => &["${own_response}", "${other_responses}"],
        "meta" => &["${own_meta}", "${other_meta_responses}"],
        _ => &[],
    };
    pattern.stages.iter().skip(index + 1).any(|later| {
        pattern
            .template_for(later)
            .map(|template| {
                template.contains(&direct)
                    || personal.iter().any(|variable| template.contains(variable))
            })
            .unwrap_or(false)
    })
}

fn summary_update(pattern: &str, content: String) -> StreamUpdate {
    StreamUpdate {
        model: String::new(),
        stage: "summary".to_string(),
        content,
        done: true,
        progress: 100,
        cached: false,
        pattern: pattern.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::config::ProviderKind;
    use quorum_engines::mock::MockAdapter;

    fn engine() -> Orchestrator {
        Orchestrator::with_defaults()
    }

    fn register(engine: &Orchestrator, id: &str, response: &str, weight: f64) -> Arc<MockAdapter> {
        let adapter = Arc::new(MockAdapter::with_response(id, response));
        engine
            .register_adapter(
                ModelConfig::new(ProviderKind::Mock, id).with_weight(weight),
                adapter.clone(),
            )
            .unwrap();
        adapter
    }

    #[test]
    fn selection_strategies_are_deterministic() {
        let engine = Orchestrator::new(OrchestratorConfig {
            max_workers: Some(2),
            ..Default::default()
        });
        register(&engine, "charlie", "c", 1.0);
        register(&engine, "alpha", "a", 1.0);
        register(&engine, "bravo", "b", 5.0);

        let weighted = engine.select_models(None, SelectionStrategy::Weighted).unwrap();
        assert_eq!(weighted, vec!["bravo", "alpha", "charlie"]);

        let best = engine.select_models(None, SelectionStrategy::Best).unwrap();
        assert_eq!(best, vec!["bravo", "alpha"]);

        let random = engine.select_models(None, SelectionStrategy::Random).unwrap();
        assert_eq!(random.len(), 2);

        let err = engine
            .select_models(Some(&["ghost".to_string()]), SelectionStrategy::All)
            .unwrap_err();
        assert_eq!(err.kind, quorum_core::error::ErrorKind::BadRequest);
    }

    #[test]
    fn required_later_detection() {
        let library = PatternLibrary::builtin();
        let confidence = library.get("confidence").unwrap();
        assert!(stage_required_later(&confidence, 0));

        let gut = library.get("gut").unwrap();
        assert!(!stage_required_later(&gut, 0));

        let comparative = library.get("comparative").unwrap();
        assert!(stage_required_later(&comparative, 0));
        assert!(stage_required_later(&comparative, 1));
        assert!(!stage_required_later(&comparative, 2));
    }

    #[tokio::test]
    async fn unknown_pattern_is_a_bad_request() {
        let engine = engine();
        register(&engine, "mA", "pong", 1.0);
        let request = OrchestrationRequest::new("ping").with_pattern("nonsense");
        let err = engine.process(&request).await.unwrap_err();
        assert_eq!(err.kind, quorum_core::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn no_models_is_an_internal_error() {
        let engine = engine();
        let request = OrchestrationRequest::new("ping");
        let err = engine.process(&request).await.unwrap_err();
        assert_eq!(err.kind, quorum_core::error::ErrorKind::Internal);
    }

    #[tokio::test]
    async fn metrics_accumulate_per_model() {
        let engine = engine();
        register(&engine, "mA", "pong", 1.0);
        let request = OrchestrationRequest::new("ping");
        engine.process(&request).await.unwrap();

        let metrics = engine.metrics();
        assert_eq!(metrics["mA"].successes, 1);
        assert!(metrics["mA"].tokens_used > 0);

        engine.reset_metrics();
        assert!(engine.metrics().is_empty());
    }
}
