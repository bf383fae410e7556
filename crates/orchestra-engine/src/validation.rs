//! Response validation: structural rules, composite score and confidence.
//!
//! Stage 4 runs the [`ResponseRule`]s over an agent response and collects
//! [`Diagnostic`]s; any `Error` diagnostic makes the response structurally
//! invalid. Stages 5 and 6 fold the scorer's [`SubScores`] into a weighted
//! composite and derive a confidence from how well the structural verdict and
//! the quality verdict agree. A malformed response is never an error here; it
//! just scores low.

use serde::{Deserialize, Serialize};

use orchestra_types::{DecisionThresholds, ScoreWeights, Task};

use crate::agent::{AgentResponse, AgentStatus};
use crate::scorer::SubScores;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// ResponseRule trait
// ---------------------------------------------------------------------------

pub trait ResponseRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, task: &Task, response: &AgentResponse) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers shared with the scorer
// ---------------------------------------------------------------------------

/// Parse `text` as JSON, falling back to the first fenced code block.
pub(crate) fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find("```")?;
    let after_fence = &trimmed[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    serde_json::from_str(body[..end].trim()).ok()
}

/// Required sections not mentioned in `text` (case-insensitive).
pub(crate) fn missing_sections(text: &str, sections: &[String]) -> Vec<String> {
    let lower = text.to_lowercase();
    sections
        .iter()
        .filter(|s| !lower.contains(&s.to_lowercase()))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl ResponseRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, _task: &Task, response: &AgentResponse) -> Vec<Diagnostic> {
        if response.text.trim().is_empty() {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Response is empty".into(),
                fix: Some("Produce the requested output".into()),
            }]
        } else {
            vec![]
        }
    }
}

struct AgentStatusRule;
impl ResponseRule for AgentStatusRule {
    fn name(&self) -> &str { "agent_status" }
    fn apply(&self, _task: &Task, response: &AgentResponse) -> Vec<Diagnostic> {
        if response.status == AgentStatus::Error {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Agent reported an error result".into(),
                fix: None,
            }]
        } else {
            vec![]
        }
    }
}

struct JsonFormatRule;
impl ResponseRule for JsonFormatRule {
    fn name(&self) -> &str { "json_format" }
    fn apply(&self, task: &Task, response: &AgentResponse) -> Vec<Diagnostic> {
        if task.expected_format() != Some("json") || response.text.trim().is_empty() {
            return vec![];
        }
        if extract_json(&response.text).is_some() {
            vec![]
        } else {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Response is not valid JSON".into(),
                fix: Some("Return a single JSON document, optionally in a ```json fence".into()),
            }]
        }
    }
}

struct RequiredSectionsRule;
impl ResponseRule for RequiredSectionsRule {
    fn name(&self) -> &str { "required_sections" }
    fn apply(&self, task: &Task, response: &AgentResponse) -> Vec<Diagnostic> {
        let sections = task.required_sections();
        if sections.is_empty() || response.text.trim().is_empty() {
            return vec![];
        }
        missing_sections(&response.text, &sections)
            .into_iter()
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Missing required section '{s}'"),
                fix: Some(format!("Add a '{s}' section")),
            })
            .collect()
    }
}

/// The built-in rule set.
pub fn default_rules() -> Vec<Box<dyn ResponseRule>> {
    vec![
        Box::new(NonEmptyRule),
        Box::new(AgentStatusRule),
        Box::new(JsonFormatRule),
        Box::new(RequiredSectionsRule),
    ]
}

// ---------------------------------------------------------------------------
// ValidationPipeline
// ---------------------------------------------------------------------------

/// Confidence ceiling when the structural and quality verdicts disagree.
pub const DISAGREEMENT_CONFIDENCE: f64 = 0.25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub diagnostics: Vec<Diagnostic>,
    pub structural_valid: bool,
    pub sub_scores: SubScores,
    pub composite_score: f64,
    pub confidence: f64,
    /// Human-readable gaps fed into the next attempt's prompt.
    pub shortfall: Vec<String>,
}

pub struct ValidationPipeline {
    weights: ScoreWeights,
    accept_threshold: f64,
    rules: Vec<Box<dyn ResponseRule>>,
}

impl ValidationPipeline {
    pub fn new(weights: ScoreWeights, thresholds: DecisionThresholds) -> Self {
        Self {
            weights,
            accept_threshold: thresholds.accept_threshold,
            rules: default_rules(),
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn ResponseRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Stage 4: structural validation.
    pub fn check_structure(&self, task: &Task, response: &AgentResponse) -> Vec<Diagnostic> {
        self.rules
            .iter()
            .flat_map(|rule| rule.apply(task, response))
            .collect()
    }

    /// Weighted composite, normalised by the weight sum so it stays in `[0, 1]`.
    pub fn composite(&self, scores: &SubScores) -> f64 {
        let w = &self.weights;
        let total = w.sum();
        if total <= 0.0 {
            return 0.0;
        }
        (w.schema * scores.schema_score
            + w.completeness * scores.completeness_score
            + w.rule * scores.rule_score)
            / total
    }

    /// Agreement between the structural verdict and the quality verdict.
    ///
    /// When both agree, confidence falls with the spread of the sub-scores
    /// (`1 - 0.5 * spread`, so at least 0.5). When they disagree it is held
    /// at [`DISAGREEMENT_CONFIDENCE`] whatever the individual scores are.
    pub fn confidence(&self, structural_valid: bool, composite: f64, scores: &SubScores) -> f64 {
        let quality_pass = composite >= self.accept_threshold;
        if structural_valid != quality_pass {
            return DISAGREEMENT_CONFIDENCE;
        }
        1.0 - 0.5 * (scores.max() - scores.min())
    }

    /// Stages 5 and 6: fold diagnostics and sub-scores into a report.
    pub fn assess(&self, diagnostics: Vec<Diagnostic>, sub_scores: SubScores) -> ValidationReport {
        let sub_scores = sub_scores.clamped();
        let structural_valid = !diagnostics.iter().any(|d| d.severity == Severity::Error);
        let composite_score = self.composite(&sub_scores);
        let confidence = self.confidence(structural_valid, composite_score, &sub_scores);

        let mut shortfall: Vec<String> = diagnostics
            .iter()
            .filter(|d| d.severity != Severity::Info)
            .map(|d| match &d.fix {
                Some(fix) => format!("{} ({fix})", d.message),
                None => d.message.clone(),
            })
            .collect();
        for (name, value) in [
            ("schema", sub_scores.schema_score),
            ("completeness", sub_scores.completeness_score),
            ("rule compliance", sub_scores.rule_score),
        ] {
            if value < self.accept_threshold {
                shortfall.push(format!(
                    "{name} score {value:.2} is below {:.2}",
                    self.accept_threshold
                ));
            }
        }

        ValidationReport {
            diagnostics,
            structural_valid,
            sub_scores,
            composite_score,
            confidence,
            shortfall,
        }
    }

    /// Structural check plus assessment in one call.
    pub fn evaluate(&self, task: &Task, response: &AgentResponse, sub_scores: SubScores) -> ValidationReport {
        let diagnostics = self.check_structure(task, response);
        self.assess(diagnostics, sub_scores)
    }
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        Self::new(ScoreWeights::default(), DecisionThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::model::meta_keys;

    fn task() -> Task {
        crate::graph::tests::task("t1", &[], 0)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn composite_uses_default_weights() {
        let p = ValidationPipeline::default();
        let c = p.composite(&SubScores::new(1.0, 0.5, 0.0));
        assert!(approx(c, 0.3 + 0.15));
    }

    #[test]
    fn composite_normalises_custom_weights() {
        let p = ValidationPipeline::new(
            ScoreWeights { schema: 1.0, completeness: 1.0, rule: 2.0 },
            DecisionThresholds::default(),
        );
        assert!(approx(p.composite(&SubScores::uniform(1.0)), 1.0));
    }

    #[test]
    fn clean_response_is_valid_and_confident() {
        let report = ValidationPipeline::default().evaluate(
            &task(),
            &AgentResponse::success("done"),
            SubScores::uniform(0.9),
        );
        assert!(report.structural_valid);
        assert!(approx(report.composite_score, 0.9));
        assert!(approx(report.confidence, 1.0));
        assert!(report.shortfall.is_empty());
    }

    #[test]
    fn disagreement_forces_low_confidence() {
        // valid structure, poor quality
        let report = ValidationPipeline::default().evaluate(
            &task(),
            &AgentResponse::success("done"),
            SubScores::uniform(0.3),
        );
        assert!(report.structural_valid);
        assert!(approx(report.confidence, DISAGREEMENT_CONFIDENCE));

        // invalid structure, high quality
        let report = ValidationPipeline::default().evaluate(
            &task(),
            &AgentResponse::error("partial"),
            SubScores::uniform(0.95),
        );
        assert!(!report.structural_valid);
        assert!(approx(report.confidence, DISAGREEMENT_CONFIDENCE));
    }

    #[test]
    fn agreement_confidence_tracks_spread() {
        let p = ValidationPipeline::default();
        let scores = SubScores::new(1.0, 0.8, 0.6);
        let c = p.confidence(true, 0.78, &scores);
        assert!(approx(c, 0.8));
    }

    #[test]
    fn empty_response_is_structurally_invalid_not_an_error() {
        let report = ValidationPipeline::default().evaluate(
            &task(),
            &AgentResponse::success(""),
            SubScores::uniform(0.0),
        );
        assert!(!report.structural_valid);
        assert_eq!(report.composite_score, 0.0);
        assert!(report.diagnostics.iter().any(|d| d.rule == "non_empty"));
        assert!(report.shortfall.iter().any(|s| s.contains("empty")));
    }

    #[test]
    fn format_and_section_rules() {
        let mut t = task();
        t.metadata
            .insert(meta_keys::EXPECTED_FORMAT.into(), serde_json::json!("json"));
        t.metadata
            .insert(meta_keys::REQUIRED_SECTIONS.into(), serde_json::json!(["summary"]));

        let diags = ValidationPipeline::default()
            .check_structure(&t, &AgentResponse::success("plain text"));
        let rules: Vec<_> = diags.iter().map(|d| d.rule.as_str()).collect();
        assert!(rules.contains(&"json_format"));
        assert!(rules.contains(&"required_sections"));

        let diags = ValidationPipeline::default()
            .check_structure(&t, &AgentResponse::success(r#"{"summary": "ok"}"#));
        assert!(diags.is_empty());
    }

    #[test]
    fn custom_rules_run_after_builtins() {
        struct NoApologies;
        impl ResponseRule for NoApologies {
            fn name(&self) -> &str { "no_apologies" }
            fn apply(&self, _task: &Task, response: &AgentResponse) -> Vec<Diagnostic> {
                if response.text.contains("sorry") {
                    vec![Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: "Apology in output".into(),
                        fix: None,
                    }]
                } else {
                    vec![]
                }
            }
        }

        let report = ValidationPipeline::default()
            .with_rule(Box::new(NoApologies))
            .evaluate(&task(), &AgentResponse::success("sorry, done"), SubScores::uniform(1.0));
        // warnings do not break structure
        assert!(report.structural_valid);
        assert_eq!(report.shortfall, vec!["Apology in output".to_string()]);
    }

    #[test]
    fn extracts_fenced_json() {
        assert!(extract_json("Here:\n```json\n[1, 2]\n```\nthanks").is_some());
        assert!(extract_json("no json here").is_none());
    }
}
