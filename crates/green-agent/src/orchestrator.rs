//! The adaptive loop: generate a round, dispatch it, evaluate it, rank
//! weaknesses, decide whether to continue.
//!
//! Rounds are strictly sequential; cases within a round run concurrently.
//! Turn ingestion for a given case stays in arrival order because each case
//! is pumped by a single task reading its own turn stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::InteractionChannel;
use crate::config::ScenarioConfig;
use crate::errors::HarnessError;
use crate::evaluator::Evaluator;
use crate::generator::AdaptiveGenerator;
use crate::model::{CaseId, EvaluationResult, TestCase, TestRound, WeaknessTag};
use crate::platform::{ArtifactSink, Stage, StatusReporter};
use crate::report::{FinalReport, RoundReport, TerminationReason};
use crate::state_machine::{RunState, StateMachine};
use crate::weakness::WeaknessAnalyzer;

/// What a finished run hands back.
///
/// The report is always present — a failed artifact submission is fatal to
/// the run's completion status but never to the recorded results.
pub struct RunOutcome {
    pub report: FinalReport,
    pub submission_error: Option<HarnessError>,
}

pub struct AdaptiveLoop {
    config: ScenarioConfig,
    generator: AdaptiveGenerator,
    evaluator: Arc<Evaluator>,
    analyzer: Arc<WeaknessAnalyzer>,
    channel: Arc<dyn InteractionChannel>,
    reporter: Arc<dyn StatusReporter>,
    sink: Arc<dyn ArtifactSink>,
    cancel: CancellationToken,
    state: StateMachine,
    /// Every generated round, retained for audit.
    rounds: Vec<TestRound>,
    round_reports: Vec<RoundReport>,
}

impl AdaptiveLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ScenarioConfig,
        generator: AdaptiveGenerator,
        evaluator: Arc<Evaluator>,
        analyzer: Arc<WeaknessAnalyzer>,
        channel: Arc<dyn InteractionChannel>,
        reporter: Arc<dyn StatusReporter>,
        sink: Arc<dyn ArtifactSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            generator,
            evaluator,
            analyzer,
            channel,
            reporter,
            sink,
            cancel,
            state: StateMachine::new(),
            rounds: Vec::new(),
            round_reports: Vec::new(),
        }
    }

    /// Drive the run to termination.
    pub async fn run(mut self) -> Result<RunOutcome> {
        self.config.validate().context("invalid scenario config")?;

        // INIT: the first round has no weakness bias.
        self.analyzer.set_round(1);
        let mut round = self
            .generator
            .generate_initial_round(1, self.config.initial_round_size)
            .await;

        loop {
            if round.is_empty() {
                warn!(round = round.index, "Round came back empty");
                let index = round.index;
                self.state
                    .advance(RunState::Terminated, Some("generation exhausted"))
                    .context("state machine")?;
                return self.terminate(TerminationReason::GenerationExhausted, Some(index))
                    .await;
            }

            self.state.set_round(round.index);
            self.state
                .advance(RunState::RoundInProgress, Some("round generated"))
                .context("state machine")?;
            self.analyzer.set_round(round.index);

            let report = self.run_round(&round).await;
            self.rounds.push(round);
            self.reporter
                .update_status(
                    Stage::RoundComplete,
                    json!({
                        "round": report.index,
                        "pass_rate": report.pass_rate,
                        "results": report.results.len(),
                    }),
                )
                .await;
            self.round_reports.push(report);
            self.state
                .advance(RunState::RoundComplete, None)
                .context("state machine")?;

            let next_index = self.state.round() + 1;
            let top_score = self.analyzer.snapshot().first().map(|r| r.score);
            let pass_rates: Vec<f64> = self.round_reports.iter().map(|r| r.pass_rate).collect();
            if let Some(reason) = should_terminate(
                &self.config,
                self.state.round(),
                top_score,
                &pass_rates,
                self.cancel.is_cancelled(),
            ) {
                self.state
                    .advance(RunState::Terminated, Some(&reason.to_string()))
                    .context("state machine")?;
                return self.terminate(reason, None).await;
            }

            // Steer the next round at the current top-k weaknesses.
            let targets = self.analyzer.get_top_weaknesses(self.config.top_k);
            info!(round = next_index, targets = ?targets, "Targeting weaknesses");
            let guidance: HashMap<WeaknessTag, serde_json::Value> = targets
                .iter()
                .filter_map(|t| self.analyzer.guidance_for(t).map(|g| (t.clone(), g)))
                .collect();
            self.analyzer.set_round(next_index);
            round = self
                .generator
                .generate_round(
                    next_index,
                    &targets,
                    self.config.cases_per_weakness,
                    &guidance,
                )
                .await;
        }
    }

    /// Dispatch every case in the round concurrently, stream turns into the
    /// evaluator, and collect finalized results.
    async fn run_round(&self, round: &TestRound) -> RoundReport {
        self.reporter
            .update_status(
                Stage::RoundStart,
                json!({"round": round.index, "cases": round.cases.len()}),
            )
            .await;

        let mut tasks: JoinSet<Option<EvaluationResult>> = JoinSet::new();
        let mut skipped: Vec<CaseId> = Vec::new();

        for case in &round.cases {
            self.evaluator.register_case(case);

            // Cancellation mid-round: in-flight cases finish or time out,
            // but no new dispatches start.
            if self.cancel.is_cancelled() {
                if self.config.count_undispatched_as_timeout {
                    if let Ok(result) = self.evaluator.finalize_timeout(&case.id) {
                        let _ = tasks.spawn(async move { Some(result) });
                    }
                } else {
                    skipped.push(case.id.clone());
                }
                continue;
            }

            let channel = Arc::clone(&self.channel);
            let evaluator = Arc::clone(&self.evaluator);
            let case = case.clone();
            let timeout = self.config.per_case_timeout();
            tasks.spawn(async move { run_case(channel, evaluator, case, timeout).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Case task panicked"),
            }
        }

        RoundReport::new(round.index, round.cases.len(), results, skipped)
    }

    /// Assemble the final report and submit it.
    async fn terminate(
        self,
        reason: TerminationReason,
        exhausted_round: Option<u32>,
    ) -> Result<RunOutcome> {
        if let Some(index) = exhausted_round {
            warn!(round = index, "Run ended early: generation exhausted");
        }

        let report = FinalReport {
            generated_at: Utc::now(),
            rounds: self.round_reports,
            weakness_ranking: self.analyzer.snapshot(),
            aggregate: self.analyzer.aggregate(),
            termination_reason: reason,
        };

        self.reporter
            .update_status(
                Stage::RunTerminated,
                json!({"reason": reason, "summary": report.summary()}),
            )
            .await;

        let submission_error = match self.sink.add_artifacts(&report).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Artifact submission failed — results retained in memory");
                Some(e)
            }
        };

        info!(summary = %report.summary(), "Run terminated");
        Ok(RunOutcome {
            report,
            submission_error,
        })
    }
}

/// Process one case: pump its turn stream into the evaluator until a
/// verdict lands or the per-case budget runs out.
async fn run_case(
    channel: Arc<dyn InteractionChannel>,
    evaluator: Arc<Evaluator>,
    case: TestCase,
    budget: Duration,
) -> Option<EvaluationResult> {
    let deadline = Instant::now() + budget;

    let mut turns = match channel.dispatch(&case).await {
        Ok(rx) => rx,
        Err(e) => {
            // Unrecoverable dispatch failure: the case times out, the round
            // continues with the remaining cases.
            warn!(case_id = %case.id, error = %e, "Dispatch failed");
            return evaluator.finalize_timeout(&case.id).ok();
        }
    };

    loop {
        let rest = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(rest, turns.recv()).await {
            Ok(Some(turn)) => match evaluator.ingest_turn(&case.id, turn) {
                Ok(Some(result)) => return Some(result),
                Ok(None) => {}
                Err(HarnessError::Validation(msg)) => {
                    // Only the malformed turn is dropped; the case goes on.
                    warn!(case_id = %case.id, msg, "Discarded malformed turn");
                }
                Err(e) => {
                    warn!(case_id = %case.id, error = %e, "Turn rejected");
                    return None;
                }
            },
            Ok(None) => {
                // Stream closed without a terminal verdict.
                return evaluator.finalize_timeout(&case.id).ok();
            }
            Err(_) => {
                info!(case_id = %case.id, "Per-case budget exceeded");
                return evaluator.finalize_timeout(&case.id).ok();
            }
        }
    }
}

/// Decide whether the run stops after the round that just completed.
fn should_terminate(
    config: &ScenarioConfig,
    completed_rounds: u32,
    top_score: Option<f64>,
    pass_rates: &[f64],
    cancelled: bool,
) -> Option<TerminationReason> {
    if cancelled {
        return Some(TerminationReason::Cancelled);
    }
    if completed_rounds >= config.max_rounds {
        return Some(TerminationReason::MaxRounds);
    }
    // No weakness evidence at all, or nothing left above the floor: there is
    // nothing to target in another round.
    match top_score {
        Some(score) if score >= config.weakness_score_floor => {}
        _ => return Some(TerminationReason::ScoreFloor),
    }
    if config.convergence_threshold > 0.0 && pass_rates.len() >= 2 {
        let delta = (pass_rates[pass_rates.len() - 1] - pass_rates[pass_rates.len() - 2]).abs();
        if delta < config.convergence_threshold {
            return Some(TerminationReason::Converged);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScenarioConfig {
        ScenarioConfig {
            max_rounds: 5,
            weakness_score_floor: 0.1,
            convergence_threshold: 0.0,
            ..ScenarioConfig::default()
        }
    }

    #[test]
    fn continues_while_weaknesses_remain() {
        assert_eq!(
            should_terminate(&config(), 1, Some(0.8), &[0.5], false),
            None
        );
    }

    #[test]
    fn stops_at_max_rounds() {
        assert_eq!(
            should_terminate(&config(), 5, Some(0.8), &[0.5], false),
            Some(TerminationReason::MaxRounds)
        );
    }

    #[test]
    fn stops_below_score_floor() {
        assert_eq!(
            should_terminate(&config(), 2, Some(0.05), &[0.9], false),
            Some(TerminationReason::ScoreFloor)
        );
    }

    #[test]
    fn stops_when_no_weakness_evidence() {
        assert_eq!(
            should_terminate(&config(), 1, None, &[1.0], false),
            Some(TerminationReason::ScoreFloor)
        );
    }

    #[test]
    fn cancellation_wins_over_everything() {
        assert_eq!(
            should_terminate(&config(), 1, Some(0.9), &[0.2], true),
            Some(TerminationReason::Cancelled)
        );
    }

    #[test]
    fn converges_on_flat_pass_rate() {
        let config = ScenarioConfig {
            convergence_threshold: 0.05,
            ..config()
        };
        assert_eq!(
            should_terminate(&config, 2, Some(0.8), &[0.52, 0.50], false),
            Some(TerminationReason::Converged)
        );
        // Still moving → keep going
        assert_eq!(
            should_terminate(&config, 2, Some(0.8), &[0.3, 0.6], false),
            None
        );
    }
}
