// crates/quorum-core/src/cost.rs

//! Static cost coefficients for cost-aware model ordering.
//!
//! Rates are rough USD-per-1K-token figures. They exist so the cost-optimised
//! strategy can order candidates cheapest-first without a network call; they
//! are not a billing system.

use crate::config::ProviderKind;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Cost rates for one model tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostRates {
    /// USD per 1K prompt tokens
    pub prompt_rate: f64,
    /// USD per 1K completion tokens
    pub completion_rate: f64,
}

struct TierRates {
    provider: ProviderKind,
    /// Substring of the model id identifying the tier, most specific first
    tier: &'static str,
    rates: CostRates,
}

static PRICING: Lazy<Vec<TierRates>> = Lazy::new(|| {
    use ProviderKind::*;
    vec![
        TierRates { provider: OpenAi, tier: "gpt-4o-mini", rates: CostRates { prompt_rate: 0.00015, completion_rate: 0.0006 } },
        TierRates { provider: OpenAi, tier: "gpt-4o", rates: CostRates { prompt_rate: 0.005, completion_rate: 0.015 } },
        TierRates { provider: OpenAi, tier: "gpt-4", rates: CostRates { prompt_rate: 0.01, completion_rate: 0.03 } },
        TierRates { provider: OpenAi, tier: "gpt-3.5", rates: CostRates { prompt_rate: 0.0015, completion_rate: 0.002 } },
        TierRates { provider: Anthropic, tier: "opus", rates: CostRates { prompt_rate: 0.015, completion_rate: 0.075 } },
        TierRates { provider: Anthropic, tier: "sonnet", rates: CostRates { prompt_rate: 0.003, completion_rate: 0.015 } },
        TierRates { provider: Anthropic, tier: "haiku", rates: CostRates { prompt_rate: 0.00025, completion_rate: 0.00125 } },
        TierRates { provider: Google, tier: "flash", rates: CostRates { prompt_rate: 0.000075, completion_rate: 0.0003 } },
        TierRates { provider: Google, tier: "gemini", rates: CostRates { prompt_rate: 0.00125, completion_rate: 0.005 } },
        TierRates { provider: Cohere, tier: "command-r-plus", rates: CostRates { prompt_rate: 0.0025, completion_rate: 0.01 } },
        TierRates { provider: Cohere, tier: "command", rates: CostRates { prompt_rate: 0.0005, completion_rate: 0.0015 } },
        TierRates { provider: Mistral, tier: "large", rates: CostRates { prompt_rate: 0.002, completion_rate: 0.006 } },
        TierRates { provider: Mistral, tier: "small", rates: CostRates { prompt_rate: 0.0002, completion_rate: 0.0006 } },
    ]
});

/// Fallback rates for unknown tiers of a known provider.
const DEFAULT_RATES: CostRates = CostRates {
    prompt_rate: 0.001,
    completion_rate: 0.003,
};

/// Free local backends.
const FREE_RATES: CostRates = CostRates {
    prompt_rate: 0.0,
    completion_rate: 0.0,
};

/// Look up the cost rates for a model.
pub fn rates_for(provider: ProviderKind, model_id: &str) -> CostRates {
    if matches!(
        provider,
        ProviderKind::Mock | ProviderKind::LocalRunner | ProviderKind::Custom
    ) {
        return FREE_RATES;
    }
    let model = model_id.to_ascii_lowercase();
    PRICING
        .iter()
        .find(|entry| entry.provider == provider && model.contains(entry.tier))
        .map(|entry| entry.rates)
        .unwrap_or(DEFAULT_RATES)
}

/// Estimated USD cost of sending `prompt_tokens` to a model, assuming a
/// completion of roughly the same length.
pub fn estimate_cost(provider: ProviderKind, model_id: &str, prompt_tokens: u32) -> f64 {
    let rates = rates_for(provider, model_id);
    let kilotokens = prompt_tokens as f64 / 1000.0;
    kilotokens * (rates.prompt_rate + rates.completion_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_lookup_prefers_specific_match() {
        let mini = rates_for(ProviderKind::OpenAi, "gpt-4o-mini");
        let full = rates_for(ProviderKind::OpenAi, "gpt-4o");
        assert!(mini.prompt_rate < full.prompt_rate);
    }

    #[test]
    fn local_backends_are_free() {
        assert_eq!(estimate_cost(ProviderKind::Mock, "anything", 10_000), 0.0);
        assert_eq!(estimate_cost(ProviderKind::LocalRunner, "llama", 10_000), 0.0);
    }

    #[test]
    fn estimates_order_tiers_by_price() {
        let cheap = estimate_cost(ProviderKind::Anthropic, "claude-3-haiku", 1000);
        let expensive = estimate_cost(ProviderKind::Anthropic, "claude-3-opus", 1000);
        assert!(cheap < expensive);
        assert!(cheap > 0.0);
    }

    #[test]
    fn unknown_tier_uses_default_rates() {
        let rates = rates_for(ProviderKind::OpenAi, "o1-experimental");
        assert_eq!(rates.prompt_rate, 0.001);
    }
}
