// crates/quorum-orchestrator/src/strategy.rs

//! Execution strategy selection.
//!
//! A strategy maps to a concrete [`ExecutionPlan`]: which models to use, how
//! to dispatch them (concurrently, optionally stopping early, or one at a
//! time), whether to score quality, and an optional pattern override. Cost
//! ordering uses the static coefficient table and never calls the network.

use quorum_core::config::ProviderKind;
use quorum_core::cost::estimate_cost;
use quorum_core::types::approximate_tokens;
use quorum_engines::registry::AdapterRegistry;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// All models, quality evaluation, synthesis by the lead
    #[strum(ascii_case_insensitive, to_string = "simple")]
    Simple,
    /// All models concurrently
    #[strum(ascii_case_insensitive, to_string = "parallel")]
    Parallel,
    /// Candidates one at a time until one succeeds
    #[strum(ascii_case_insensitive, to_string = "waterfall")]
    Waterfall,
    /// Parallel, early-stop after two successes
    #[strum(ascii_case_insensitive, to_string = "balanced")]
    Balanced,
    /// Simple with the comparative pattern
    #[strum(ascii_case_insensitive, to_string = "quality", serialize = "quality_optimised")]
    QualityOptimised,
    /// Parallel, early-stop after the first success
    #[strum(ascii_case_insensitive, to_string = "speed", serialize = "speed_optimised")]
    SpeedOptimised,
    /// Waterfall ordered by estimated cost ascending
    #[strum(ascii_case_insensitive, to_string = "cost", serialize = "cost_optimised")]
    CostOptimised,
    /// Picks one of the above from load, prompt size, and hints
    #[strum(ascii_case_insensitive, to_string = "adaptive")]
    Adaptive,
}

/// How a stage's dispatches run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// All at once; `min_responses` stops the stage early once that many
    /// have succeeded, cancelling the rest
    Concurrent { min_responses: Option<usize> },
    /// One at a time, stopping at the first success
    Sequential,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub strategy: ExecutionStrategy,
    /// Ordered model ids to dispatch
    pub models: Vec<String>,
    pub mode: DispatchMode,
    pub evaluate_quality: bool,
    /// Pattern the strategy insists on, if any
    pub pattern: Option<String>,
}

/// Caller preferences consulted by the adaptive strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyHints {
    pub prefer_speed: bool,
    pub prefer_quality: bool,
}

/// Prompt length beyond which the adaptive strategy stops fanning out wide.
const LONG_PROMPT_TOKENS: u32 = 2000;

/// CPU load beyond which the adaptive strategy sheds work.
const HIGH_LOAD_CPU: f64 = 75.0;

pub struct StrategySelector;

impl StrategySelector {
    /// Resolve a strategy against the current registry.
    ///
    /// `load_cpu` is the optimiser's latest CPU reading, when one exists.
    pub fn plan(
        strategy: ExecutionStrategy,
        registry: &AdapterRegistry,
        prompt: &str,
        hints: StrategyHints,
        load_cpu: Option<f64>,
    ) -> ExecutionPlan {
        match strategy {
            ExecutionStrategy::Simple => ExecutionPlan {
                strategy,
                models: registry.prioritized(None),
                mode: DispatchMode::Concurrent { min_responses: None },
                evaluate_quality: true,
                pattern: None,
            },
            ExecutionStrategy::Parallel => ExecutionPlan {
                strategy,
                models: registry.prioritized(None),
                mode: DispatchMode::Concurrent { min_responses: None },
                evaluate_quality: false,
                pattern: None,
            },
            ExecutionStrategy::Waterfall => ExecutionPlan {
                strategy,
                models: registry.prioritized(None),
                mode: DispatchMode::Sequential,
                evaluate_quality: false,
                pattern: None,
            },
            ExecutionStrategy::Balanced => ExecutionPlan {
                strategy,
                models: registry.prioritized(None),
                mode: DispatchMode::Concurrent { min_responses: Some(2) },
                evaluate_quality: false,
                pattern: None,
            },
            ExecutionStrategy::QualityOptimised => ExecutionPlan {
                strategy,
                models: registry.prioritized(None),
                mode: DispatchMode::Concurrent { min_responses: None },
                evaluate_quality: true,
                pattern: Some("comparative".to_string()),
            },
            ExecutionStrategy::SpeedOptimised => ExecutionPlan {
                strategy,
                models: registry.prioritized(None),
                mode: DispatchMode::Concurrent { min_responses: Some(1) },
                evaluate_quality: false,
                pattern: None,
            },
            ExecutionStrategy::CostOptimised => ExecutionPlan {
                strategy,
                models: Self::cost_ordered(registry, prompt),
                mode: DispatchMode::Sequential,
                evaluate_quality: false,
                pattern: None,
            },
            ExecutionStrategy::Adaptive => {
                let resolved = Self::adapt(registry, prompt, hints, load_cpu);
                Self::plan(resolved, registry, prompt, hints, load_cpu)
            }
        }
    }

    fn adapt(
        _registry: &AdapterRegistry,
        prompt: &str,
        hints: StrategyHints,
        load_cpu: Option<f64>,
    ) -> ExecutionStrategy {
        let loaded = load_cpu.map(|cpu| cpu >= HIGH_LOAD_CPU).unwrap_or(false);
        let long_prompt = approximate_tokens(prompt) > LONG_PROMPT_TOKENS;

        if hints.prefer_quality && !loaded {
            ExecutionStrategy::QualityOptimised
        } else if hints.prefer_speed || loaded || long_prompt {
            ExecutionStrategy::SpeedOptimised
        } else {
            ExecutionStrategy::Balanced
        }
    }

    /// Registry ids ordered by estimated request cost ascending, ties by
    /// model id.
    fn cost_ordered(registry: &AdapterRegistry, prompt: &str) -> Vec<String> {
        let prompt_tokens = approximate_tokens(prompt);
        let mut priced: Vec<(String, f64)> = registry
            .list()
            .into_iter()
            .filter_map(|id| {
                let provider = registry.get(&id)?.config.provider;
                Some((id.clone(), Self::estimate(provider, &id, prompt_tokens)))
            })
            .collect();
        priced.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        priced.into_iter().map(|(id, _)| id).collect()
    }

    fn estimate(provider: ProviderKind, model_id: &str, prompt_tokens: u32) -> f64 {
        estimate_cost(provider, model_id, prompt_tokens)
    }
}
