//! Quality-gated decision state machine.
//!
//! Each evaluated response enters [`DecisionState::Evaluating`] and leaves it
//! for exactly one terminal state. Rules apply in a fixed order: the score
//! gates (accept, then retry band) come before the confidence check.

use std::fmt;

use serde::{Deserialize, Serialize};

use orchestra_types::{DecisionAction, DecisionThresholds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Evaluating,
    Proceed,
    Retry,
    Clarify,
    Escalate,
}

impl DecisionState {
    pub fn action(self) -> Option<DecisionAction> {
        match self {
            Self::Evaluating => None,
            Self::Proceed => Some(DecisionAction::Proceed),
            Self::Retry => Some(DecisionAction::Retry),
            Self::Clarify => Some(DecisionAction::Clarify),
            Self::Escalate => Some(DecisionAction::Escalate),
        }
    }
}

impl From<DecisionAction> for DecisionState {
    fn from(action: DecisionAction) -> Self {
        match action {
            DecisionAction::Proceed => Self::Proceed,
            DecisionAction::Retry => Self::Retry,
            DecisionAction::Clarify => Self::Clarify,
            DecisionAction::Escalate => Self::Escalate,
        }
    }
}

impl fmt::Display for DecisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action() {
            Some(action) => fmt::Display::fmt(&action, f),
            None => f.write_str("evaluating"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionInput {
    pub composite_score: f64,
    pub confidence: f64,
    pub retry_count: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: DecisionAction,
    pub rationale: String,
    pub input: DecisionInput,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    thresholds: DecisionThresholds,
}

impl DecisionEngine {
    pub fn new(thresholds: DecisionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> DecisionThresholds {
        self.thresholds
    }

    /// Move from `Evaluating` to a terminal state.
    pub fn transition(&self, state: DecisionState, input: &DecisionInput) -> DecisionState {
        match state {
            DecisionState::Evaluating => self.evaluate(input).action.into(),
            terminal => terminal,
        }
    }

    pub fn evaluate(&self, input: &DecisionInput) -> Decision {
        let t = &self.thresholds;
        let score = input.composite_score;
        let confidence = input.confidence;

        let (action, rationale) = if score >= t.accept_threshold
            && confidence >= t.confidence_threshold
        {
            (
                DecisionAction::Proceed,
                format!(
                    "score {score:.2} >= {:.2} and confidence {confidence:.2} >= {:.2}",
                    t.accept_threshold, t.confidence_threshold
                ),
            )
        } else if input.retry_count < input.max_retries
            && score >= t.low_floor
            && score < t.accept_threshold
        {
            (
                DecisionAction::Retry,
                format!(
                    "score {score:.2} in retry band [{:.2}, {:.2}), retry {} of {}",
                    t.low_floor,
                    t.accept_threshold,
                    input.retry_count + 1,
                    input.max_retries
                ),
            )
        } else if confidence < t.confidence_threshold {
            (
                DecisionAction::Clarify,
                format!(
                    "confidence {confidence:.2} below {:.2} with score {score:.2}; human input needed",
                    t.confidence_threshold
                ),
            )
        } else if score < t.low_floor {
            (
                DecisionAction::Escalate,
                format!("score {score:.2} below floor {:.2}", t.low_floor),
            )
        } else {
            (
                DecisionAction::Escalate,
                format!(
                    "score {score:.2} below {:.2} after {} of {} retries",
                    t.accept_threshold, input.retry_count, input.max_retries
                ),
            )
        };

        tracing::debug!(%action, score, confidence, retry_count = input.retry_count, "Decision");
        Decision {
            action,
            rationale,
            input: *input,
        }
    }
}
