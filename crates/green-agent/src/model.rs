//! Core data model: cases, rounds, turns, and evaluation results.
//!
//! `TestCase` content and success criteria are opaque JSON payloads produced
//! by the generation service — the harness never interprets the content, and
//! only the evaluator interprets the criteria.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique case identifier, `{round}-{ordinal}` by convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub String);

impl CaseId {
    pub fn new(round: u32, ordinal: usize) -> Self {
        Self(format!("{round}-{ordinal}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key identifying one recurring weakness of the subject agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeaknessTag(pub String);

impl WeaknessTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WeaknessTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for WeaknessTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Case difficulty, ordered easiest to hardest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyTier {
    Easy,
    Medium,
    Hard,
}

impl DifficultyTier {
    /// All tiers in ascending difficulty order.
    pub const ALL: [DifficultyTier; 3] = [Self::Easy, Self::Medium, Self::Hard];
}

impl fmt::Display for DifficultyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// One generated test case. Immutable once created; owned by its round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: CaseId,
    /// Weakness the case targets. `None` for initial-round cases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weakness_tag: Option<WeaknessTag>,
    pub tier: DifficultyTier,
    /// Opaque payload from the generation service (instruction text etc.).
    pub content: Value,
    /// Opaque payload interpreted only by the evaluator.
    pub success_criteria: Value,
}

/// One round of cases. Order is preserved for deterministic replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRound {
    pub index: u32,
    pub cases: Vec<TestCase>,
}

impl TestRound {
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

/// One execution turn of the subject agent on a case.
///
/// Turns arrive incrementally; a case's turns are not guaranteed to arrive
/// as one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTurn {
    pub case_id: CaseId,
    /// Sequence number within the case, starting at 0.
    pub seq: u32,
    /// Action the subject agent took.
    pub action: Value,
    /// Observation / result of that action. May carry a terminal `status`
    /// field (`completed` / `failed`) and a reported `final_state` object.
    pub observation: Value,
    pub timestamp: DateTime<Utc>,
}

/// Terminal signal parsed from a turn's observation, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSignal {
    Completed,
    Failed,
}

impl ExecutionTurn {
    /// Parse the explicit terminal signal from the observation, if present.
    pub fn signal(&self) -> Option<TurnSignal> {
        match self.observation.get("status").and_then(Value::as_str) {
            Some("completed") => Some(TurnSignal::Completed),
            Some("failed") => Some(TurnSignal::Failed),
            _ => None,
        }
    }
}

/// Per-case evaluation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Partial,
    Timeout,
    /// The case's own success criteria were malformed. Reported, but
    /// excluded from weakness attribution.
    Invalid,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Partial => write!(f, "partial"),
            Self::Timeout => write!(f, "timeout"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// Finalized result for one case. Produced exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub case_id: CaseId,
    pub tier: DifficultyTier,
    pub verdict: Verdict,
    /// Scoring evidence: match flags and mismatch descriptions.
    pub rationale: Value,
    /// Weaknesses implicated by this result. Empty for `invalid` verdicts.
    pub weakness_tags: Vec<WeaknessTag>,
    /// How many turns the evaluator saw before finalizing.
    pub turns_seen: u32,
}
