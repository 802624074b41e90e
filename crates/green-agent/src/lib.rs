//! Adaptive evaluation harness for subject agents.
//!
//! A "green" orchestrating agent generates test cases for a target
//! ("purple") agent, scores its multi-turn execution traces, accumulates a
//! weakness profile, and steers each subsequent round of generation at the
//! current top-ranked weaknesses.

pub mod channel;
pub mod config;
pub mod errors;
pub mod evaluator;
pub mod generation;
pub mod generator;
pub mod model;
pub mod orchestrator;
pub mod platform;
pub mod report;
pub mod state_machine;
pub mod weakness;

pub use config::ScenarioConfig;
pub use errors::HarnessError;
pub use evaluator::Evaluator;
pub use generator::AdaptiveGenerator;
pub use model::{
    CaseId, DifficultyTier, EvaluationResult, ExecutionTurn, TestCase, TestRound, Verdict,
    WeaknessTag,
};
pub use orchestrator::{AdaptiveLoop, RunOutcome};
pub use report::{FinalReport, RoundReport, TerminationReason};
pub use weakness::{SeverityWeighted, WeaknessAnalyzer, WeaknessStore};
