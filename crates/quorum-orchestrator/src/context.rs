// crates/quorum-orchestrator/src/context.rs

//! Stage context construction.
//!
//! Before each stage the orchestrator builds a variable map from the
//! original prompt and every prior stage's responses. Two views exist: the
//! shared base context, and a per-model overlay that distinguishes a model's
//! own earlier answer (`own_response`, `own_meta`) from everyone else's
//! (`other_responses`, `other_meta_responses`).

use quorum_core::types::ModelResponse;
use std::collections::HashMap;

pub type StageContext = HashMap<String, String>;

/// Responses of one completed stage, keyed by model id.
pub type StageResponses = HashMap<String, ModelResponse>;

/// Combined rendering of a stage's responses, one block per model, in
/// deterministic (alphabetical) order. `exclude` drops one model's answer.
fn combine(responses: &StageResponses, exclude: Option<&str>) -> String {
    let mut models: Vec<&String> = responses.keys().collect();
    models.sort();
    models
        .into_iter()
        .filter(|model| Some(model.as_str()) != exclude)
        .map(|model| format!("Model {}:\n{}", model, responses[model].content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Shared context: `original_prompt`, plus `<stage>_responses` and
/// `<model>_<stage>` for every completed stage.
pub fn base_context(
    original_prompt: &str,
    history: &[(String, StageResponses)],
) -> StageContext {
    let mut context = StageContext::new();
    context.insert("original_prompt".to_string(), original_prompt.to_string());

    for (stage, responses) in history {
        if responses.is_empty() {
            continue;
        }
        context.insert(format!("{}_responses", stage), combine(responses, None));
        for (model, response) in responses {
            context.insert(format!("{}_{}", model, stage), response.content.clone());
        }
    }
    context
}

/// Overlay the per-model variables onto a copy of the base context.
pub fn personalize(
    base: &StageContext,
    model: &str,
    history: &[(String, StageResponses)],
) -> StageContext {
    let mut context = base.clone();
    for (stage, responses) in history {
        let own = responses
            .get(model)
            .map(|response| response.content.clone())
            .unwrap_or_default();
        let others = combine(responses, Some(model));
        match stage.as_str() {
            "initial" => {
                context.insert("own_response".to_string(), own);
                context.insert("other_responses".to_string(), others);
            }
            "meta" => {
                context.insert("own_meta".to_string(), own);
                context.insert("other_meta_responses".to_string(), others);
            }
            _ => {}
        }
    }
    context
}
