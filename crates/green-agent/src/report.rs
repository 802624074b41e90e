//! Round-level and run-level reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{CaseId, EvaluationResult, Verdict};
use crate::weakness::{AggregateStats, WeaknessRecord};

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxRounds,
    ScoreFloor,
    Converged,
    Cancelled,
    GenerationExhausted,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxRounds => write!(f, "max rounds reached"),
            Self::ScoreFloor => write!(f, "top weakness score below floor"),
            Self::Converged => write!(f, "pass rate converged"),
            Self::Cancelled => write!(f, "externally cancelled"),
            Self::GenerationExhausted => write!(f, "generation exhausted"),
        }
    }
}

/// Everything that happened in one round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub index: u32,
    pub cases_generated: usize,
    pub results: Vec<EvaluationResult>,
    /// Cases that never received a verdict (run ended first).
    pub skipped_cases: Vec<CaseId>,
    pub pass_rate: f64,
}

impl RoundReport {
    pub fn new(
        index: u32,
        cases_generated: usize,
        results: Vec<EvaluationResult>,
        skipped_cases: Vec<CaseId>,
    ) -> Self {
        let passed = results
            .iter()
            .filter(|r| r.verdict == Verdict::Pass)
            .count();
        let pass_rate = passed as f64 / results.len().max(1) as f64;
        Self {
            index,
            cases_generated,
            results,
            skipped_cases,
            pass_rate,
        }
    }
}

/// The run's final artifact: per-round results plus the weakness ranking.
#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub generated_at: DateTime<Utc>,
    pub rounds: Vec<RoundReport>,
    /// Ranked weakness snapshot, weakest first.
    pub weakness_ranking: Vec<WeaknessRecord>,
    pub aggregate: AggregateStats,
    pub termination_reason: TerminationReason,
}

impl FinalReport {
    pub fn summary(&self) -> String {
        let total: usize = self.rounds.iter().map(|r| r.results.len()).sum();
        let overall = self.aggregate.total.pass_rate();
        format!(
            "{} rounds, {} cases, pass rate {:.0}% — {}",
            self.rounds.len(),
            total,
            overall * 100.0,
            self.termination_reason,
        )
    }
}
