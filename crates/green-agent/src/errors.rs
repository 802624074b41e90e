//! Harness error taxonomy with run-fatality classification.
//!
//! Every error in the adaptive loop is represented here. Callers can query
//! `is_run_fatal()` without string matching.
//!
//! ## Containment rules
//!
//! | Error                 | Scope     | Handling                          |
//! |-----------------------|-----------|-----------------------------------|
//! | Generation            | slot      | retried, then slot skipped        |
//! | Validation            | turn      | turn discarded, case continues    |
//! | Channel               | case      | case marked timeout, round continues |
//! | CaseAlreadyFinalized  | case      | rejected, no state change         |
//! | UnknownCase           | case      | rejected, no state change         |
//! | Submission            | run       | completion fails, data retained   |
//! | Configuration         | run       | refused at startup                |
//!
//! Timeouts and generation exhaustion are not errors: they surface as a
//! `timeout` verdict and a termination reason respectively.

use thiserror::Error;

/// Unified error type for the adaptive evaluation harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    // ── Contained (never abort a round) ───────────────────────────────────
    /// The generation service could not produce a valid case for one slot.
    #[error("Generation failed for {slot}: {message}")]
    Generation { slot: String, message: String },

    /// A turn or a case's success criteria was malformed.
    #[error("Validation failure: {0}")]
    Validation(String),

    /// The interaction channel failed while a case was in flight.
    #[error("Channel failure for case {case_id}: {message}")]
    Channel { case_id: String, message: String },

    /// A turn or finalization arrived for a case that already has a verdict.
    #[error("Case {0} already finalized")]
    CaseAlreadyFinalized(String),

    /// A turn arrived for a case the evaluator has never seen.
    #[error("Unknown case {0}")]
    UnknownCase(String),

    // ── Run-fatal ─────────────────────────────────────────────────────────
    /// Final artifact submission failed. Recorded results stay retrievable.
    #[error("Artifact submission failed: {0}")]
    Submission(String),

    /// Scenario configuration is invalid or missing required fields.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl HarnessError {
    /// Whether this error terminates the run (as opposed to being contained
    /// at the slot, turn, or case level).
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::Submission(_) | Self::Configuration(_))
    }

    /// Build a `Generation` variant conveniently.
    pub fn generation(slot: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Generation {
            slot: slot.into(),
            message: message.into(),
        }
    }

    /// Build a `Channel` variant conveniently.
    pub fn channel(case_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            case_id: case_id.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_contained() {
        let err = HarnessError::generation("round1/easy/2", "upstream 503");
        assert!(!err.is_run_fatal());
    }

    #[test]
    fn validation_is_contained() {
        let err = HarnessError::Validation("turn missing action field".into());
        assert!(!err.is_run_fatal());
    }

    #[test]
    fn configuration_is_fatal() {
        let err = HarnessError::Configuration("top_k must be at least 1".into());
        assert!(err.is_run_fatal());
    }

    #[test]
    fn submission_is_fatal() {
        let err = HarnessError::Submission("platform returned 500".into());
        assert!(err.is_run_fatal());
    }

    #[test]
    fn channel_failure_is_contained() {
        let err = HarnessError::channel("2-1", "connection reset");
        assert!(!err.is_run_fatal());
    }
}
