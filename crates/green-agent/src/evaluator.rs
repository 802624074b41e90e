//! Per-case evaluation over incrementally arriving turns.
//!
//! A case stays in flight while its turns stream in; the verdict estimate is
//! re-derived from the full turn history on every ingestion and a case is
//! finalized exactly once — on an explicit terminal signal, on reaching the
//! turn budget, or when the orchestrator declares a timeout.
//!
//! Finalized results are forwarded to the weakness analyzer by a direct
//! synchronous call before being returned, so later cases in the same round
//! already see an updated weakness picture.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::errors::HarnessError;
use crate::model::{
    CaseId, EvaluationResult, ExecutionTurn, TestCase, TurnSignal, Verdict, WeaknessTag,
};
use crate::weakness::WeaknessAnalyzer;

/// Success criteria parsed from a case's opaque criteria payload.
///
/// Shape: `{expected_actions: [...], expected_final_state: {...},
/// dimension?: "..."}`. The optional dimension labels which weakness an
/// untagged (initial-round) case implicates on finalization.
struct Criteria {
    expected_actions: Vec<Value>,
    expected_final_state: Map<String, Value>,
    dimension: Option<String>,
}

impl Criteria {
    fn parse(raw: &Value) -> Result<Self, String> {
        let obj = raw
            .as_object()
            .ok_or_else(|| "criteria is not an object".to_string())?;
        let expected_actions = match obj.get("expected_actions") {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err("expected_actions is not an array".into()),
            None => return Err("missing expected_actions".into()),
        };
        let expected_final_state = match obj.get("expected_final_state") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err("expected_final_state is not an object".into()),
            None => return Err("missing expected_final_state".into()),
        };
        let dimension = obj
            .get("dimension")
            .and_then(Value::as_str)
            .map(String::from);
        Ok(Self {
            expected_actions,
            expected_final_state,
            dimension,
        })
    }
}

/// Accumulating state for one in-flight case.
struct CaseProgress {
    case: TestCase,
    criteria: Result<Criteria, String>,
    turns: Vec<ExecutionTurn>,
    finalized: bool,
}

/// Outcome of assessing the turn history against the criteria.
struct Assessment {
    verdict: Verdict,
    rationale: Value,
}

/// Scores execution traces case by case and keeps the analyzer in sync.
pub struct Evaluator {
    analyzer: Arc<WeaknessAnalyzer>,
    max_turns_per_case: u32,
    in_flight: Mutex<HashMap<CaseId, CaseProgress>>,
}

impl Evaluator {
    pub fn new(analyzer: Arc<WeaknessAnalyzer>, max_turns_per_case: u32) -> Self {
        Self {
            analyzer,
            max_turns_per_case,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Register a case before dispatch so its criteria are on hand when the
    /// first turn arrives. Parsing happens once, here.
    pub fn register_case(&self, case: &TestCase) {
        let criteria = Criteria::parse(&case.success_criteria);
        if let Err(reason) = &criteria {
            debug!(case_id = %case.id, reason, "Case criteria malformed");
        }
        self.in_flight.lock().expect("evaluator poisoned").insert(
            case.id.clone(),
            CaseProgress {
                case: case.clone(),
                criteria,
                turns: Vec::new(),
                finalized: false,
            },
        );
    }

    /// Ingest one turn for a case, in arrival order.
    ///
    /// Returns `Ok(Some(result))` when the turn brought the case to a
    /// terminal condition, `Ok(None)` while the case stays in flight. A
    /// malformed turn yields `Validation` and leaves the case untouched.
    pub fn ingest_turn(
        &self,
        case_id: &CaseId,
        turn: ExecutionTurn,
    ) -> Result<Option<EvaluationResult>, HarnessError> {
        if turn.action.is_null() || turn.observation.is_null() {
            return Err(HarnessError::Validation(format!(
                "turn {} for case {case_id} missing action or observation",
                turn.seq
            )));
        }

        let mut in_flight = self.in_flight.lock().expect("evaluator poisoned");
        let progress = in_flight
            .get_mut(case_id)
            .ok_or_else(|| HarnessError::UnknownCase(case_id.to_string()))?;
        if progress.finalized {
            return Err(HarnessError::CaseAlreadyFinalized(case_id.to_string()));
        }

        let signal = turn.signal();
        progress.turns.push(turn);

        let criteria = match &progress.criteria {
            Ok(c) => c,
            // Malformed criteria: the case can never be scored — report it
            // as invalid on the first turn and take it out of flight.
            Err(reason) => {
                let rationale = json!({"error": format!("malformed success criteria: {reason}")});
                let result = finalize(progress, Verdict::Invalid, rationale);
                drop(in_flight);
                self.forward(&result);
                return Ok(Some(result));
            }
        };

        let terminal = match signal {
            Some(TurnSignal::Completed) => Some(assess(criteria, &progress.turns)),
            Some(TurnSignal::Failed) => Some(Assessment {
                verdict: Verdict::Fail,
                rationale: json!({"error": "subject agent reported failure"}),
            }),
            None if progress.turns.len() as u32 >= self.max_turns_per_case => {
                // Turn budget exhausted without a signal: score whatever the
                // history supports.
                Some(assess(criteria, &progress.turns))
            }
            None => None,
        };

        match terminal {
            Some(assessment) => {
                let result = finalize(progress, assessment.verdict, assessment.rationale);
                drop(in_flight);
                self.forward(&result);
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    /// Force a `timeout` verdict for a case that exceeded its budget
    /// without reaching a terminal condition through `ingest_turn`.
    pub fn finalize_timeout(&self, case_id: &CaseId) -> Result<EvaluationResult, HarnessError> {
        let mut in_flight = self.in_flight.lock().expect("evaluator poisoned");
        let progress = in_flight
            .get_mut(case_id)
            .ok_or_else(|| HarnessError::UnknownCase(case_id.to_string()))?;
        if progress.finalized {
            return Err(HarnessError::CaseAlreadyFinalized(case_id.to_string()));
        }

        let rationale = json!({
            "error": "case exceeded its budget",
            "turns_seen": progress.turns.len(),
        });
        let result = finalize(progress, Verdict::Timeout, rationale);
        drop(in_flight);
        self.forward(&result);
        Ok(result)
    }

    /// Whether a case is still awaiting a verdict.
    pub fn is_in_flight(&self, case_id: &CaseId) -> bool {
        self.in_flight
            .lock()
            .expect("evaluator poisoned")
            .get(case_id)
            .map(|p| !p.finalized)
            .unwrap_or(false)
    }

    /// Synchronous forward to the analyzer — evaluation and weakness
    /// tracking stay in step, result by result, never batched.
    fn forward(&self, result: &EvaluationResult) {
        info!(
            case_id = %result.case_id,
            verdict = %result.verdict,
            turns = result.turns_seen,
            "Case finalized"
        );
        self.analyzer.ingest(result);
    }
}

/// Build the finalized result and mark the case terminal.
fn finalize(progress: &mut CaseProgress, verdict: Verdict, rationale: Value) -> EvaluationResult {
    progress.finalized = true;

    let weakness_tags = if verdict == Verdict::Invalid {
        Vec::new()
    } else {
        implicated_tags(progress)
    };

    EvaluationResult {
        case_id: progress.case.id.clone(),
        tier: progress.case.tier,
        verdict,
        rationale,
        weakness_tags,
        turns_seen: progress.turns.len() as u32,
    }
}

/// Which weaknesses this case speaks to: its target tag when it has one,
/// otherwise the dimension label from its criteria (initial-round cases).
fn implicated_tags(progress: &CaseProgress) -> Vec<WeaknessTag> {
    if let Some(tag) = &progress.case.weakness_tag {
        return vec![tag.clone()];
    }
    if let Ok(criteria) = &progress.criteria {
        if let Some(dimension) = &criteria.dimension {
            return vec![WeaknessTag(dimension.clone())];
        }
    }
    Vec::new()
}

/// Assess the full turn history against the criteria.
///
/// Sequence and state both match → `pass`; sequence matches but the final
/// state diverges → `partial`; anything else → `fail`.
fn assess(criteria: &Criteria, turns: &[ExecutionTurn]) -> Assessment {
    let mut errors: Vec<String> = Vec::new();

    let actual_actions = collect_actions(turns);
    let sequence_match = verify_sequence(&criteria.expected_actions, &actual_actions, &mut errors);

    let final_state = turns
        .iter()
        .rev()
        .find_map(|t| t.observation.get("final_state"))
        .and_then(Value::as_object);
    let state_match = verify_state(&criteria.expected_final_state, final_state, &mut errors);

    let verdict = match (sequence_match, state_match) {
        (true, true) => Verdict::Pass,
        (true, false) => Verdict::Partial,
        _ => Verdict::Fail,
    };

    Assessment {
        verdict,
        rationale: json!({
            "sequence_match": sequence_match,
            "state_match": state_match,
            "errors": errors,
        }),
    }
}

/// Flatten the actions taken across turns, in order. A turn's action may be
/// a single call or a batch.
fn collect_actions(turns: &[ExecutionTurn]) -> Vec<Value> {
    let mut actions = Vec::new();
    for turn in turns {
        match &turn.action {
            Value::Array(batch) => actions.extend(batch.iter().cloned()),
            other => actions.push(other.clone()),
        }
    }
    actions
}

fn verify_sequence(expected: &[Value], actual: &[Value], errors: &mut Vec<String>) -> bool {
    if expected.len() != actual.len() {
        errors.push(format!(
            "action count mismatch: expected {}, got {}",
            expected.len(),
            actual.len()
        ));
        return false;
    }
    let mut ok = true;
    for (i, (exp, act)) in expected.iter().zip(actual).enumerate() {
        if exp != act {
            errors.push(format!("action #{i} mismatch: expected {exp}, got {act}"));
            ok = false;
        }
    }
    ok
}

/// Only keys named by the criteria are checked — the final state may carry
/// more than the case cares about.
fn verify_state(
    expected: &Map<String, Value>,
    actual: Option<&Map<String, Value>>,
    errors: &mut Vec<String>,
) -> bool {
    if expected.is_empty() {
        return true;
    }
    let Some(actual) = actual else {
        errors.push("no final state reported".into());
        return false;
    };
    let mut ok = true;
    for (key, expected_value) in expected {
        match actual.get(key) {
            Some(actual_value) if actual_value == expected_value => {}
            Some(actual_value) => {
                errors.push(format!(
                    "state mismatch [{key}]: expected {expected_value}, got {actual_value}"
                ));
                ok = false;
            }
            None => {
                errors.push(format!("missing key in final state: {key}"));
                ok = false;
            }
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DifficultyTier;
    use crate::weakness::{SeverityWeighted, WeaknessStore};
    use chrono::Utc;

    fn evaluator(max_turns: u32) -> Evaluator {
        let analyzer = Arc::new(WeaknessAnalyzer::new(
            WeaknessStore::new(),
            Box::new(SeverityWeighted),
        ));
        Evaluator::new(analyzer, max_turns)
    }

    fn case(id: &str, tag: Option<&str>, criteria: Value) -> TestCase {
        TestCase {
            id: CaseId(id.into()),
            weakness_tag: tag.map(WeaknessTag::from),
            tier: DifficultyTier::Easy,
            content: json!({"instruction": "turn on the living room light"}),
            success_criteria: criteria,
        }
    }

    fn light_criteria() -> Value {
        json!({
            "expected_actions": [{"action": "update", "key": "living_room_light", "value": "on"}],
            "expected_final_state": {"living_room_light": "on"},
            "dimension": "precision",
        })
    }

    fn turn(id: &str, seq: u32, action: Value, observation: Value) -> ExecutionTurn {
        ExecutionTurn {
            case_id: CaseId(id.into()),
            seq,
            action,
            observation,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn pass_emitted_only_on_terminal_turn() {
        let ev = evaluator(8);
        ev.register_case(&case("1-0", None, light_criteria()));

        // t1: action issued, no terminal signal → stays in flight
        let r1 = ev
            .ingest_turn(
                &CaseId("1-0".into()),
                turn(
                    "1-0",
                    0,
                    json!({"action": "update", "key": "living_room_light", "value": "on"}),
                    json!({"status": "working"}),
                ),
            )
            .unwrap();
        assert!(r1.is_none());
        assert!(ev.is_in_flight(&CaseId("1-0".into())));

        // t2: explicit success → exactly one pass result
        let r2 = ev
            .ingest_turn(
                &CaseId("1-0".into()),
                turn(
                    "1-0",
                    1,
                    json!([]),
                    json!({"status": "completed", "final_state": {"living_room_light": "on"}}),
                ),
            )
            .unwrap()
            .unwrap();
        assert_eq!(r2.verdict, Verdict::Pass);
        assert_eq!(r2.turns_seen, 2);
        assert!(!ev.is_in_flight(&CaseId("1-0".into())));
    }

    #[test]
    fn state_mismatch_with_matching_sequence_is_partial() {
        let ev = evaluator(8);
        ev.register_case(&case("1-1", None, light_criteria()));

        let result = ev
            .ingest_turn(
                &CaseId("1-1".into()),
                turn(
                    "1-1",
                    0,
                    json!({"action": "update", "key": "living_room_light", "value": "on"}),
                    json!({"status": "completed", "final_state": {"living_room_light": "off"}}),
                ),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.verdict, Verdict::Partial);
        assert_eq!(result.rationale["sequence_match"], json!(true));
        assert_eq!(result.rationale["state_match"], json!(false));
    }

    #[test]
    fn wrong_sequence_is_fail() {
        let ev = evaluator(8);
        ev.register_case(&case("1-2", Some("precision"), light_criteria()));

        let result = ev
            .ingest_turn(
                &CaseId("1-2".into()),
                turn(
                    "1-2",
                    0,
                    json!({"action": "update", "key": "bedroom_light", "value": "on"}),
                    json!({"status": "completed", "final_state": {"living_room_light": "on"}}),
                ),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.weakness_tags, vec![WeaknessTag::from("precision")]);
    }

    #[test]
    fn explicit_failure_signal_is_fail() {
        let ev = evaluator(8);
        ev.register_case(&case("1-3", None, light_criteria()));

        let result = ev
            .ingest_turn(
                &CaseId("1-3".into()),
                turn("1-3", 0, json!([]), json!({"status": "failed"})),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
    }

    #[test]
    fn turn_budget_forces_assessment() {
        let ev = evaluator(2);
        ev.register_case(&case("1-4", None, light_criteria()));
        let id = CaseId("1-4".into());

        assert!(ev
            .ingest_turn(
                &id,
                turn(
                    "1-4",
                    0,
                    json!({"action": "update", "key": "living_room_light", "value": "on"}),
                    json!({"status": "working"}),
                ),
            )
            .unwrap()
            .is_none());

        // Second turn hits the budget without any signal
        let result = ev
            .ingest_turn(
                &id,
                turn(
                    "1-4",
                    1,
                    json!([]),
                    json!({"final_state": {"living_room_light": "on"}}),
                ),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
    }

    #[test]
    fn malformed_turn_is_discarded_without_touching_state() {
        let ev = evaluator(8);
        ev.register_case(&case("1-5", None, light_criteria()));
        let id = CaseId("1-5".into());

        let err = ev
            .ingest_turn(&id, turn("1-5", 0, Value::Null, json!({})))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Validation(_)));

        // The case is still in flight and a valid turn still finalizes it
        let result = ev
            .ingest_turn(
                &id,
                turn(
                    "1-5",
                    0,
                    json!({"action": "update", "key": "living_room_light", "value": "on"}),
                    json!({"status": "completed", "final_state": {"living_room_light": "on"}}),
                ),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
        assert_eq!(result.turns_seen, 1);
    }

    #[test]
    fn malformed_criteria_yields_invalid_without_attribution() {
        let ev = evaluator(8);
        ev.register_case(&case("1-6", Some("precision"), json!("not an object")));

        let result = ev
            .ingest_turn(
                &CaseId("1-6".into()),
                turn("1-6", 0, json!([]), json!({"status": "working"})),
            )
            .unwrap()
            .unwrap();
        assert_eq!(result.verdict, Verdict::Invalid);
        assert!(result.weakness_tags.is_empty());
    }

    #[test]
    fn timeout_finalizes_exactly_once() {
        let ev = evaluator(8);
        ev.register_case(&case("1-7", None, light_criteria()));
        let id = CaseId("1-7".into());

        let result = ev.finalize_timeout(&id).unwrap();
        assert_eq!(result.verdict, Verdict::Timeout);

        // Second finalization of any kind is rejected
        assert!(matches!(
            ev.finalize_timeout(&id),
            Err(HarnessError::CaseAlreadyFinalized(_))
        ));
        assert!(matches!(
            ev.ingest_turn(&id, turn("1-7", 2, json!([]), json!({"status": "completed"}))),
            Err(HarnessError::CaseAlreadyFinalized(_))
        ));
    }

    #[test]
    fn unknown_case_is_rejected() {
        let ev = evaluator(8);
        assert!(matches!(
            ev.ingest_turn(
                &CaseId("9-9".into()),
                turn("9-9", 0, json!([]), json!({}))
            ),
            Err(HarnessError::UnknownCase(_))
        ));
        assert!(matches!(
            ev.finalize_timeout(&CaseId("9-9".into())),
            Err(HarnessError::UnknownCase(_))
        ));
    }

    #[test]
    fn finalization_updates_analyzer_synchronously() {
        let analyzer = Arc::new(WeaknessAnalyzer::new(
            WeaknessStore::new(),
            Box::new(SeverityWeighted),
        ));
        let ev = Evaluator::new(Arc::clone(&analyzer), 8);
        ev.register_case(&case("1-8", Some("memory"), light_criteria()));

        ev.ingest_turn(
            &CaseId("1-8".into()),
            turn("1-8", 0, json!([]), json!({"status": "failed"})),
        )
        .unwrap()
        .unwrap();

        // Visible immediately, not at round end
        assert_eq!(
            analyzer.get_top_weaknesses(1),
            vec![WeaknessTag::from("memory")]
        );
    }
}
