//! Quality scoring of agent responses.
//!
//! A [`QualityScorer`] produces the three sub-scores the validation pipeline
//! weighs into a composite. [`HeuristicScorer`] is the built-in, offline
//! scorer; model-backed scorers plug in through the same trait.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use orchestra_types::{OrchestraError, Result, Task};

use crate::agent::{AgentResponse, AgentStatus};
use crate::validation::{extract_json, missing_sections};

/// Per-dimension quality scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub schema_score: f64,
    pub completeness_score: f64,
    pub rule_score: f64,
}

impl SubScores {
    pub fn new(schema_score: f64, completeness_score: f64, rule_score: f64) -> Self {
        Self {
            schema_score,
            completeness_score,
            rule_score,
        }
    }

    pub fn uniform(score: f64) -> Self {
        Self::new(score, score, score)
    }

    /// Clamp into `[0, 1]`; NaN becomes 0.
    pub fn clamped(self) -> Self {
        let c = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Self::new(c(self.schema_score), c(self.completeness_score), c(self.rule_score))
    }

    pub fn min(&self) -> f64 {
        self.schema_score.min(self.completeness_score).min(self.rule_score)
    }

    pub fn max(&self) -> f64 {
        self.schema_score.max(self.completeness_score).max(self.rule_score)
    }
}

#[async_trait]
pub trait QualityScorer: Send + Sync {
    fn name(&self) -> &str;
    async fn score(&self, task: &Task, response: &AgentResponse, rules: &[String])
        -> Result<SubScores>;
}

// ---------------------------------------------------------------------------
// HeuristicScorer
// ---------------------------------------------------------------------------

/// Offline scorer built from format, section and rule checks.
///
/// Rules are strings of the form:
///   - `contains:<text>` / `not_contains:<text>` (case-insensitive)
///   - `regex:<pattern>`
///   - `min_length:<chars>`
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer;

/// Evaluate one rule against `text`.
pub fn check_rule(rule: &str, text: &str) -> Result<bool> {
    let (kind, arg) = rule.split_once(':').ok_or_else(|| {
        OrchestraError::Validation(format!("rule '{rule}' is missing a '<kind>:' prefix"))
    })?;
    let arg = arg.trim();
    match kind.trim() {
        "contains" => Ok(text.to_lowercase().contains(&arg.to_lowercase())),
        "not_contains" => Ok(!text.to_lowercase().contains(&arg.to_lowercase())),
        "regex" => {
            let re = Regex::new(arg)
                .map_err(|e| OrchestraError::Validation(format!("rule '{rule}': {e}")))?;
            Ok(re.is_match(text))
        }
        "min_length" => {
            let min: usize = arg
                .parse()
                .map_err(|_| OrchestraError::Validation(format!("rule '{rule}': not a length")))?;
            Ok(text.trim().chars().count() >= min)
        }
        other => Err(OrchestraError::Validation(format!("unknown rule kind '{other}'"))),
    }
}

#[async_trait]
impl QualityScorer for HeuristicScorer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn score(
        &self,
        task: &Task,
        response: &AgentResponse,
        rules: &[String],
    ) -> Result<SubScores> {
        let text = response.text.trim();
        if text.is_empty() {
            return Ok(SubScores::uniform(0.0));
        }

        let schema_score = match (task.expected_format(), response.status) {
            (Some("json"), _) if extract_json(text).is_none() => 0.0,
            (_, AgentStatus::Error) => 0.5,
            _ => 1.0,
        };

        let sections = task.required_sections();
        let completeness_score = if sections.is_empty() {
            1.0
        } else {
            let missing = missing_sections(text, &sections).len();
            (sections.len() - missing) as f64 / sections.len() as f64
        };

        let rule_score = if rules.is_empty() {
            1.0
        } else {
            let mut passed = 0usize;
            for rule in rules {
                if check_rule(rule, text)? {
                    passed += 1;
                }
            }
            passed as f64 / rules.len() as f64
        };

        let scores = SubScores::new(schema_score, completeness_score, rule_score);
        tracing::debug!(task = %task.id, ?scores, "Heuristic scores");
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::model::meta_keys;

    fn task() -> Task {
        crate::graph::tests::task("t1", &[], 0)
    }

    #[test]
    fn rule_kinds() {
        assert!(check_rule("contains:Hello", "hello world").unwrap());
        assert!(!check_rule("not_contains:TODO", "fix the todo").unwrap());
        assert!(check_rule(r"regex:^fn \w+", "fn main() {}").unwrap());
        assert!(check_rule("min_length:5", "abcdef").unwrap());
        assert!(!check_rule("min_length:10", "  abc  ").unwrap());
    }

    #[test]
    fn malformed_rules_are_validation_errors() {
        assert!(matches!(check_rule("nonsense", "x"), Err(OrchestraError::Validation(_))));
        assert!(check_rule("regex:(", "x").is_err());
        assert!(check_rule("min_length:many", "x").is_err());
        assert!(check_rule("shout:x", "x").is_err());
    }

    #[tokio::test]
    async fn empty_response_scores_zero() {
        let scores = HeuristicScorer
            .score(&task(), &AgentResponse::success("   "), &[])
            .await
            .unwrap();
        assert_eq!(scores, SubScores::uniform(0.0));
    }

    #[tokio::test]
    async fn clean_response_scores_full() {
        let scores = HeuristicScorer
            .score(&task(), &AgentResponse::success("Implemented."), &[])
            .await
            .unwrap();
        assert_eq!(scores, SubScores::uniform(1.0));
    }

    #[tokio::test]
    async fn sections_and_rules_scored_fractionally() {
        let mut t = task();
        t.metadata.insert(
            meta_keys::REQUIRED_SECTIONS.into(),
            serde_json::json!(["Summary", "Tests"]),
        );
        let rules = vec!["contains:endpoint".to_string(), "not_contains:todo".to_string()];
        let response = AgentResponse::success("## Summary\nAdded endpoint. TODO: docs");

        let scores = HeuristicScorer.score(&t, &response, &rules).await.unwrap();
        assert_eq!(scores.schema_score, 1.0);
        assert_eq!(scores.completeness_score, 0.5);
        assert_eq!(scores.rule_score, 0.5);
    }

    #[tokio::test]
    async fn json_expectation_checked() {
        let mut t = task();
        t.metadata
            .insert(meta_keys::EXPECTED_FORMAT.into(), serde_json::json!("json"));

        let bad = HeuristicScorer
            .score(&t, &AgentResponse::success("not json"), &[])
            .await
            .unwrap();
        assert_eq!(bad.schema_score, 0.0);

        let good = HeuristicScorer
            .score(&t, &AgentResponse::success("```json\n{\"ok\": true}\n```"), &[])
            .await
            .unwrap();
        assert_eq!(good.schema_score, 1.0);
    }

    #[test]
    fn clamping() {
        let s = SubScores::new(1.4, -0.2, f64::NAN).clamped();
        assert_eq!(s, SubScores::new(1.0, 0.0, 0.0));
        assert_eq!(s.max(), 1.0);
        assert_eq!(s.min(), 0.0);
    }
}
