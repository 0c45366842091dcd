// crates/quorum-core/src/config.rs

//! Model and orchestrator configuration.
//!
//! Credentials are resolved from the environment by convention:
//! `<PROVIDER>_API_KEY` and optional `<PROVIDER>_API_BASE`. `USE_MOCK=true`
//! lets the adapter factory substitute the mock adapter for any provider
//! whose key is missing.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

/// Supported LLM backends. New providers are added at compile time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, Serialize, Deserialize, Display,
)]
pub enum ProviderKind {
    #[strum(ascii_case_insensitive, to_string = "openai")]
    OpenAi,
    #[strum(ascii_case_insensitive, to_string = "anthropic")]
    Anthropic,
    #[strum(ascii_case_insensitive, to_string = "google")]
    Google,
    #[strum(ascii_case_insensitive, to_string = "cohere")]
    Cohere,
    #[strum(ascii_case_insensitive, to_string = "mistral")]
    Mistral,
    #[strum(ascii_case_insensitive, to_string = "custom")]
    Custom,
    #[strum(ascii_case_insensitive, to_string = "mock")]
    Mock,
    #[strum(
        ascii_case_insensitive,
        to_string = "local_runner",
        serialize = "localrunner"
    )]
    LocalRunner,
}

impl ProviderKind {
    /// Environment variable prefix for this provider's credentials.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI",
            ProviderKind::Anthropic => "ANTHROPIC",
            ProviderKind::Google => "GOOGLE",
            ProviderKind::Cohere => "COHERE",
            ProviderKind::Mistral => "MISTRAL",
            ProviderKind::Custom => "CUSTOM",
            ProviderKind::Mock => "MOCK",
            ProviderKind::LocalRunner => "LOCAL_RUNNER",
        }
    }

    /// Read `<PREFIX>_API_KEY` from the environment.
    pub fn api_key_from_env(&self) -> Option<String> {
        std::env::var(format!("{}_API_KEY", self.env_prefix())).ok()
    }

    /// Read `<PREFIX>_API_BASE` from the environment.
    pub fn api_base_from_env(&self) -> Option<String> {
        std::env::var(format!("{}_API_BASE", self.env_prefix())).ok()
    }

    /// Whether this provider requires an API key at all.
    pub fn requires_key(&self) -> bool {
        !matches!(self, ProviderKind::Mock | ProviderKind::LocalRunner)
    }
}

/// Whether `USE_MOCK=true` is set, forcing mock substitution for keyless
/// providers.
pub fn use_mock_from_env() -> bool {
    std::env::var("USE_MOCK")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Description of one callable backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    /// Vendor-visible model name, e.g. `gpt-4o`
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Default per-call deadline
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Priority score for selection and ordering; must be non-negative
    pub weight: f64,
    /// Marks the default synthesis model; at most one per registry
    pub is_primary: bool,
    /// Capability tags for selection
    pub tags: HashSet<String>,
    /// Minimum spacing between calls on one adapter instance
    #[serde(with = "duration_secs")]
    pub rate_limit: Duration,
}

impl ModelConfig {
    pub fn new(provider: ProviderKind, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            api_key: None,
            api_base: None,
            max_tokens: 1024,
            temperature: 0.7,
            timeout: Duration::from_secs(60),
            weight: 1.0,
            is_primary: false,
            tags: HashSet::new(),
            rate_limit: Duration::from_millis(500),
        }
    }

    /// Build a config with credentials resolved from the environment.
    pub fn from_env(provider: ProviderKind, model_id: impl Into<String>) -> Self {
        let mut config = Self::new(provider, model_id);
        config.api_key = provider.api_key_from_env();
        config.api_base = provider.api_base_from_env();
        config
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Enforce the configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(anyhow!("model_id must not be empty"));
        }
        if self.weight < 0.0 {
            return Err(anyhow!(
                "weight must be non-negative for {}, got {}",
                self.model_id,
                self.weight
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(anyhow!(
                "temperature must be within [0, 2] for {}, got {}",
                self.model_id,
                self.temperature
            ));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("timeout must be positive for {}", self.model_id));
        }
        Ok(())
    }
}

/// How the orchestrator picks models for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Every registered, healthy model
    #[strum(ascii_case_insensitive, to_string = "all")]
    All,
    /// Top `max_workers` by weight
    #[strum(ascii_case_insensitive, to_string = "best")]
    Best,
    /// All models, ordered by weight
    #[strum(ascii_case_insensitive, to_string = "weighted")]
    Weighted,
    /// Pseudo-random subset of `max_workers`
    #[strum(ascii_case_insensitive, to_string = "random")]
    Random,
}

/// A preset bundle of pattern, model selection, and quality/cache flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMode {
    pub name: String,
    pub pattern: String,
    /// Restrict to these models; `None` means the selection strategy runs
    /// over everything registered
    pub models: Option<Vec<String>>,
    pub selection: SelectionStrategy,
    pub evaluate_quality: bool,
    pub cache_responses: bool,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl AnalysisMode {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            models: None,
            selection: SelectionStrategy::Weighted,
            evaluate_quality: true,
            cache_responses: true,
            timeout: None,
        }
    }

    /// The default preset modes.
    pub fn default_modes(default_pattern: &str) -> HashMap<String, AnalysisMode> {
        let mut modes = HashMap::new();
        modes.insert(
            "standard".to_string(),
            AnalysisMode::new("standard", default_pattern),
        );
        modes.insert(
            "fast".to_string(),
            AnalysisMode {
                selection: SelectionStrategy::Best,
                evaluate_quality: false,
                timeout: Some(Duration::from_secs(30)),
                ..AnalysisMode::new("fast", "gut")
            },
        );
        modes.insert(
            "thorough".to_string(),
            AnalysisMode {
                selection: SelectionStrategy::All,
                ..AnalysisMode::new("thorough", "confidence")
            },
        );
        modes.insert(
            "creative".to_string(),
            AnalysisMode {
                selection: SelectionStrategy::All,
                ..AnalysisMode::new("creative", "perspective")
            },
        );
        modes
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Whether the response cache participates at all
    pub cache_enabled: bool,
    /// Retry attempts per provider candidate
    pub max_retries: u32,
    /// Base delay for exponential backoff
    #[serde(with = "duration_secs")]
    pub retry_base_delay: Duration,
    /// Backoff ceiling
    #[serde(with = "duration_secs")]
    pub retry_max_delay: Duration,
    /// Upper bound on the random jitter added to each backoff delay
    #[serde(with = "duration_secs")]
    pub retry_jitter: Duration,
    /// Cap on concurrent dispatches within one stage; `None` sizes from the
    /// resource optimiser
    pub max_workers: Option<usize>,
    pub circuit_breaker_enabled: bool,
    /// Failures before a breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker rejects before a probe is allowed
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
    pub default_pattern: String,
    /// Whether per-model metrics are accumulated
    pub collect_metrics: bool,
    /// Answer from the mock adapter when every provider candidate fails
    pub enable_mock_fallback: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            retry_jitter: Duration::from_millis(250),
            max_workers: None,
            circuit_breaker_enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            default_pattern: "gut".to_string(),
            collect_metrics: true,
            enable_mock_fallback: false,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
