//! Multi-stage orchestration over the provider adapters.
//!
//! The [`orchestrator::Orchestrator`] owns an adapter registry, response
//! cache, circuit breakers, resource optimiser, and pattern library, and
//! runs pattern-driven multi-model pipelines over them. No process-wide
//! state: tests construct a fresh engine per case.

pub mod context;
pub mod evaluator;
pub mod orchestrator;
pub mod patterns;
pub mod progress;
pub mod resource;
pub mod strategy;

pub use orchestrator::{
    Orchestrator, OrchestrationRequest, OrchestrationResult, StageOutcome, StreamUpdate,
};
pub use patterns::{Pattern, PatternLibrary};
pub use progress::{ProgressStatus, ProgressTracker, ProgressUpdate};
pub use resource::{OptimizationAction, ResourceMetrics, ResourceOptimizer};
pub use strategy::{ExecutionPlan, ExecutionStrategy, StrategySelector};
