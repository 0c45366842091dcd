// crates/quorum-orchestrator/src/patterns.rs

//! Named multi-stage prompt patterns and `${var}` template rendering.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// The stage every pattern starts with.
pub const INITIAL_STAGE: &str = "initial";

/// A named, ordered stage pipeline with one prompt template per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub stages: Vec<String>,
    pub templates: HashMap<String, String>,
}

impl Pattern {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            templates: HashMap::new(),
        }
    }

    pub fn stage(mut self, name: &str, template: &str) -> Self {
        self.stages.push(name.to_string());
        self.templates.insert(name.to_string(), template.to_string());
        self
    }

    /// A pattern must have stages, start at `initial`, and carry a template
    /// for every declared stage.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(anyhow!("pattern {} declares no stages", self.name));
        }
        if self.stages[0] != INITIAL_STAGE {
            return Err(anyhow!(
                "pattern {} must start with the {} stage, found {}",
                self.name,
                INITIAL_STAGE,
                self.stages[0]
            ));
        }
        for stage in &self.stages {
            if !self.templates.contains_key(stage) {
                return Err(anyhow!(
                    "pattern {} has no template for stage {}",
                    self.name,
                    stage
                ));
            }
        }
        Ok(())
    }

    pub fn template_for(&self, stage: &str) -> Option<&str> {
        self.templates.get(stage).map(String::as_str)
    }
}

/// Substitute `${var}` placeholders from the context.
///
/// Unknown variables render as empty text, so a stage whose predecessor
/// produced nothing still gets a usable prompt. A `$` not followed by `{`
/// passes through untouched.
pub fn render_template(template: &str, context: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(value) = context.get(name) {
                    output.push_str(value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated placeholder: emit the remainder literally.
                output.push_str(&rest[start..]);
                return output;
            }
        }
    }
    output.push_str(rest);
    output
}

/// Registry of patterns, seeded with the built-in set.
pub struct PatternLibrary {
    patterns: RwLock<HashMap<String, Pattern>>,
}

impl PatternLibrary {
    /// The canonical pattern set.
    ///
    /// | pattern | stages | intent |
    /// |---|---|---|
    /// | `gut` | initial | single independent round |
    /// | `confidence` | initial, meta | models critique and confirm each other |
    /// | `perspective` | initial, meta, hyper | divergence then reconciliation |
    /// | `comparative` | initial, meta, ultra | structured comparison then synthesis |
    pub fn builtin() -> Self {
        let library = Self {
            patterns: RwLock::new(HashMap::new()),
        };
        for pattern in builtin_patterns() {
            library
                .register(pattern)
                .expect("built-in patterns are valid");
        }
        library
    }

    pub fn empty() -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and add a pattern; replaces an existing pattern of the same
    /// name.
    pub fn register(&self, pattern: Pattern) -> Result<()> {
        pattern.validate()?;
        self.patterns
            .write()
            .map_err(|_| anyhow!("pattern library lock poisoned"))?
            .insert(pattern.name.clone(), pattern);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Pattern> {
        self.patterns.read().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .patterns
            .read()
            .map(|patterns| patterns.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

const INITIAL_TEMPLATE: &str = "\
Please analyze the following:

${original_prompt}

Provide your complete analysis with clear reasoning and specific, \
actionable insights.";

fn builtin_patterns() -> Vec<Pattern> {
    vec![
        Pattern::new("gut").stage(INITIAL_STAGE, INITIAL_TEMPLATE),
        Pattern::new("confidence")
            .stage(INITIAL_STAGE, INITIAL_TEMPLATE)
            .stage(
                "meta",
                "Original request:\n${original_prompt}\n\n\
                 Your initial answer:\n${own_response}\n\n\
                 Answers from the other models:\n${other_responses}\n\n\
                 Identify where the answers agree and disagree, state how \
                 confident you are in each of your own claims, and revise \
                 anything the other answers showed to be weak or wrong.",
            ),
        Pattern::new("perspective")
            .stage(INITIAL_STAGE, INITIAL_TEMPLATE)
            .stage(
                "meta",
                "Original request:\n${original_prompt}\n\n\
                 Your initial answer:\n${own_response}\n\n\
                 The other answers:\n${other_responses}\n\n\
                 Argue the strongest perspective that none of these answers \
                 has taken seriously. Be specific about what it changes.",
            )
            .stage(
                "hyper",
                "Original request:\n${original_prompt}\n\n\
                 First-round answers:\n${initial_responses}\n\n\
                 Alternative perspectives raised:\n${meta_responses}\n\n\
                 Reconcile these into a single coherent analysis. Note which \
                 disagreements are substantive and which are framing.",
            ),
        Pattern::new("comparative")
            .stage(INITIAL_STAGE, INITIAL_TEMPLATE)
            .stage(
                "meta",
                "Original request:\n${original_prompt}\n\n\
                 Candidate answers:\n${initial_responses}\n\n\
                 Compare the answers point by point: strengths, weaknesses, \
                 factual conflicts, and coverage gaps.",
            )
            .stage(
                "ultra",
                "Original request:\n${original_prompt}\n\n\
                 Candidate answers:\n${initial_responses}\n\n\
                 Comparative review:\n${meta_responses}\n\n\
                 Produce the definitive synthesis: keep what survived the \
                 comparison, discard what did not, and present one final \
                 answer.",
            ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builtin_set_is_complete_and_valid() {
        let library = PatternLibrary::builtin();
        assert_eq!(
            library.names(),
            vec!["comparative", "confidence", "gut", "perspective"]
        );

        let confidence = library.get("confidence").unwrap();
        assert_eq!(confidence.stages, vec!["initial", "meta"]);
        assert!(confidence.template_for("meta").unwrap().contains("${other_responses}"));

        let comparative = library.get("comparative").unwrap();
        assert_eq!(comparative.stages, vec!["initial", "meta", "ultra"]);
    }

    #[test]
    fn patterns_without_initial_are_rejected() {
        let bad = Pattern::new("bad").stage("meta", "x");
        assert!(bad.validate().is_err());
        assert!(Pattern::new("empty").validate().is_err());
    }

    #[test]
    fn missing_template_is_a_load_error() {
        let mut pattern = Pattern::new("p").stage(INITIAL_STAGE, "x");
        pattern.stages.push("meta".to_string());
        assert!(PatternLibrary::builtin().register(pattern).is_err());
    }

    #[test]
    fn render_substitutes_known_variables() {
        let rendered = render_template(
            "Q: ${original_prompt} / A: ${own_response}",
            &ctx(&[("original_prompt", "why"), ("own_response", "because")]),
        );
        assert_eq!(rendered, "Q: why / A: because");
    }

    #[test]
    fn render_blanks_unknown_variables() {
        let rendered = render_template("before [${missing}] after", &ctx(&[]));
        assert_eq!(rendered, "before [] after");
    }

    #[test]
    fn render_leaves_plain_dollars_alone() {
        let rendered = render_template("cost is $5 and ${x}", &ctx(&[("x", "y")]));
        assert_eq!(rendered, "cost is $5 and y");
    }

    #[test]
    fn render_keeps_unterminated_placeholder_literal() {
        let rendered = render_template("broken ${oops", &ctx(&[]));
        assert_eq!(rendered, "broken ${oops");
    }
}
