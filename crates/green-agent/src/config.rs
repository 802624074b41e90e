//! Scenario configuration: run-wide constants loaded at `INIT`.
//!
//! Values come from a `scenario.toml` file; keys the file omits fall back
//! to `GREEN_*` environment variables, then to built-in defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::HarnessError;

/// Run-wide configuration for one evaluation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Case count for the initial (weakness-free) round.
    pub initial_round_size: usize,
    /// Cases generated per targeted weakness (`m`).
    pub cases_per_weakness: usize,
    /// How many top weaknesses each adaptive round targets (`k`).
    pub top_k: usize,
    /// Maximum number of rounds before the run terminates.
    pub max_rounds: u32,
    /// Wall-clock budget per case, in seconds.
    pub per_case_timeout_secs: u64,
    /// Maximum turns the evaluator accepts before forcing a verdict.
    pub max_turns_per_case: u32,
    /// Terminate when the top weakness score drops below this floor.
    pub weakness_score_floor: f64,
    /// Terminate when the pass-rate delta between consecutive rounds drops
    /// below this value. 0 disables convergence termination.
    pub convergence_threshold: f64,
    /// Synthesis attempts per slot before it is skipped.
    pub synthesis_retries: u32,
    /// Whether a case that never received any turn counts as `timeout`
    /// (true) or is excluded from verdicts and listed as skipped (false).
    pub count_undispatched_as_timeout: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            initial_round_size: env_parse("GREEN_INITIAL_ROUND_SIZE", 6),
            cases_per_weakness: env_parse("GREEN_CASES_PER_WEAKNESS", 3),
            top_k: env_parse("GREEN_TOP_K", 2),
            max_rounds: env_parse("GREEN_MAX_ROUNDS", 5),
            per_case_timeout_secs: env_parse("GREEN_PER_CASE_TIMEOUT_SECS", 60),
            max_turns_per_case: env_parse("GREEN_MAX_TURNS_PER_CASE", 8),
            weakness_score_floor: env_parse("GREEN_WEAKNESS_SCORE_FLOOR", 0.1),
            convergence_threshold: env_parse("GREEN_CONVERGENCE_THRESHOLD", 0.0),
            synthesis_retries: env_parse("GREEN_SYNTHESIS_RETRIES", 3),
            count_undispatched_as_timeout: env_parse("GREEN_COUNT_UNDISPATCHED_AS_TIMEOUT", false),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl ScenarioConfig {
    /// Load from a TOML file. Env fallbacks still apply via `Default` for
    /// any key the file omits.
    pub fn from_file(path: &Path) -> Result<Self, HarnessError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Configuration(format!("read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| HarnessError::Configuration(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the loop degenerate.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.initial_round_size == 0 {
            return Err(HarnessError::Configuration(
                "initial_round_size must be at least 1".into(),
            ));
        }
        if self.cases_per_weakness == 0 {
            return Err(HarnessError::Configuration(
                "cases_per_weakness must be at least 1".into(),
            ));
        }
        if self.top_k == 0 {
            return Err(HarnessError::Configuration("top_k must be at least 1".into()));
        }
        if self.max_rounds == 0 {
            return Err(HarnessError::Configuration(
                "max_rounds must be at least 1".into(),
            ));
        }
        if self.max_turns_per_case == 0 {
            return Err(HarnessError::Configuration(
                "max_turns_per_case must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.weakness_score_floor) {
            return Err(HarnessError::Configuration(
                "weakness_score_floor must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.convergence_threshold) {
            return Err(HarnessError::Configuration(
                "convergence_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn per_case_timeout(&self) -> Duration {
        Duration::from_secs(self.per_case_timeout_secs)
    }
}
