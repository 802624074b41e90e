//! Run state machine — explicit states and legal transition guards.
//!
//! The adaptive loop calls `advance()` to move between states. Each call
//! validates that the transition is legal and records it in the transition
//! log, so every run's state history is auditable and replayable.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// The set of run states.
///
/// Every run starts at `Init` and ends at `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Loading configuration and requesting the initial round.
    Init,
    /// Dispatching cases and streaming turns into the evaluator.
    RoundInProgress,
    /// Round finished: reporting, ranking weaknesses, deciding to continue.
    RoundComplete,
    /// Final report assembled and submitted — terminal state.
    Terminated,
}

impl RunState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::RoundInProgress => write!(f, "RoundInProgress"),
            Self::RoundComplete => write!(f, "RoundComplete"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Legal transitions:
/// ```text
/// Init → RoundInProgress | Terminated
/// RoundInProgress → RoundComplete
/// RoundComplete → RoundInProgress | Terminated
/// ```
/// `Init → Terminated` covers generation exhaustion before any dispatch and
/// cancellation observed at startup.
fn is_legal_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;

    matches!(
        (from, to),
        (Init, RoundInProgress)
            | (Init, Terminated)
            | (RoundInProgress, RoundComplete)
            | (RoundComplete, RoundInProgress)
            | (RoundComplete, Terminated)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RunState,
    pub to: RunState,
    /// Round index at the time of transition (0 before the first round).
    pub round: u32,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    /// Optional context about why this transition happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: RunState,
    pub to: RunState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// The run state machine: tracks the current state, enforces legal
/// transitions, and keeps a complete log for replay and diagnostics.
pub struct StateMachine {
    current: RunState,
    round: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    /// Create a new state machine starting at `Init`.
    pub fn new() -> Self {
        Self {
            current: RunState::Init,
            round: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Set the round counter (called by the adaptive loop).
    pub fn set_round(&mut self, round: u32) {
        self.round = round;
    }

    /// Attempt to advance to the next state.
    pub fn advance(&mut self, to: RunState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            round: self.round,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            from = %self.current,
            to = %to,
            round = self.round,
            "State transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Get the full transition log.
    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), RunState::Init);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_full_run_path() {
        let mut sm = StateMachine::new();

        sm.advance(RunState::RoundInProgress, Some("initial round generated"))
            .unwrap();
        sm.set_round(1);
        sm.advance(RunState::RoundComplete, None).unwrap();
        sm.advance(RunState::RoundInProgress, Some("targeting top-2 weaknesses"))
            .unwrap();
        sm.set_round(2);
        sm.advance(RunState::RoundComplete, None).unwrap();
        sm.advance(RunState::Terminated, Some("max rounds reached"))
            .unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.transitions().len(), 5);
    }

    #[test]
    fn test_early_termination_from_init() {
        let mut sm = StateMachine::new();
        sm.advance(RunState::Terminated, Some("generation exhausted"))
            .unwrap();
        assert!(sm.is_terminal());
    }

    #[test]
    fn test_cannot_skip_round_complete() {
        let mut sm = StateMachine::new();
        sm.advance(RunState::RoundInProgress, None).unwrap();

        let err = sm.advance(RunState::Terminated, None).unwrap_err();
        assert_eq!(err.from, RunState::RoundInProgress);
        assert_eq!(err.to, RunState::Terminated);
    }

    #[test]
    fn test_cannot_transition_from_terminal() {
        let mut sm = StateMachine::new();
        sm.advance(RunState::Terminated, None).unwrap();
        assert!(sm.advance(RunState::RoundInProgress, None).is_err());
    }

    #[test]
    fn test_transition_record_has_reason() {
        let mut sm = StateMachine::new();
        sm.advance(RunState::RoundInProgress, Some("round 1 ready"))
            .unwrap();

        let record = &sm.transitions()[0];
        assert_eq!(record.from, RunState::Init);
        assert_eq!(record.to, RunState::RoundInProgress);
        assert_eq!(record.reason.as_deref(), Some("round 1 ready"));
    }

    #[test]
    fn test_transition_record_serde_roundtrip() {
        let record = TransitionRecord {
            from: RunState::RoundComplete,
            to: RunState::Terminated,
            round: 4,
            elapsed_ms: 1234,
            reason: Some("score floor reached".into()),
        };

        let json = serde_json::to_string(&record).unwrap();
        let restored: TransitionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.from, RunState::RoundComplete);
        assert_eq!(restored.to, RunState::Terminated);
        assert_eq!(restored.round, 4);
    }
}
