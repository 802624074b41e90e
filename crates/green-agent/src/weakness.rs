//! Weakness store and analyzer.
//!
//! The store is an explicit, injected dependency — the only structure
//! mutated by concurrently-finalizing evaluations. A whole-map lock
//! serializes `ingest`, which keeps weakness updates applied strictly in
//! finalization order.
//!
//! The scoring rule is pluggable: a score is always recomputed from the
//! tag's full evidence history, never overwritten destructively, and is
//! clamped to `[0, 1]` (higher = weaker).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::model::{EvaluationResult, Verdict, WeaknessTag};

/// How many recent rationales per tag are retained as generation guidance.
const GUIDANCE_DEPTH: usize = 5;

/// One piece of evidence attributed to a weakness tag.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Evidence {
    pub verdict: Verdict,
    pub round: u32,
}

/// Running record for one weakness tag. Created lazily on first evidence;
/// never deleted during a run.
#[derive(Debug, Clone, Serialize)]
pub struct WeaknessRecord {
    pub tag: WeaknessTag,
    /// Weakness score in `[0, 1]`; higher means weaker.
    pub score: f64,
    pub evidence: Vec<Evidence>,
    /// Round index of the most recent update.
    pub last_round: u32,
    /// Recent mismatch rationales, newest last, capped at `GUIDANCE_DEPTH`.
    pub recent_rationales: Vec<Value>,
}

impl WeaknessRecord {
    pub fn evidence_count(&self) -> u32 {
        self.evidence.len() as u32
    }
}

/// Pluggable weakness scoring rule.
///
/// Implementations recompute from the full history and must stay bounded in
/// `[0, 1]` for any input; the store clamps defensively regardless.
pub trait WeaknessScoring: Send + Sync {
    fn score(&self, history: &[Evidence]) -> f64;
}

/// Default rule: mean verdict severity over the history.
///
/// `fail` and `timeout` count as fully weak, `partial` as mildly weak,
/// `pass` as not weak. `invalid` never reaches the store.
pub struct SeverityWeighted;

impl SeverityWeighted {
    fn severity(verdict: Verdict) -> f64 {
        match verdict {
            Verdict::Fail | Verdict::Timeout => 1.0,
            Verdict::Partial => 0.55,
            Verdict::Pass => 0.0,
            Verdict::Invalid => 0.0,
        }
    }
}

impl WeaknessScoring for SeverityWeighted {
    fn score(&self, history: &[Evidence]) -> f64 {
        if history.is_empty() {
            return 0.0;
        }
        let sum: f64 = history.iter().map(|e| Self::severity(e.verdict)).sum();
        sum / history.len() as f64
    }
}

/// Mapping from weakness tag to record. Pure data plus update rules.
#[derive(Default)]
pub struct WeaknessStore {
    records: Mutex<HashMap<WeaknessTag, WeaknessRecord>>,
}

impl WeaknessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append evidence for `tag` and recompute its score from the full
    /// history under the store lock.
    fn absorb(
        &self,
        tag: &WeaknessTag,
        verdict: Verdict,
        round: u32,
        rationale: &Value,
        scoring: &dyn WeaknessScoring,
    ) {
        let mut records = self.records.lock().expect("weakness store poisoned");
        let record = records.entry(tag.clone()).or_insert_with(|| WeaknessRecord {
            tag: tag.clone(),
            score: 0.0,
            evidence: Vec::new(),
            last_round: round,
            recent_rationales: Vec::new(),
        });

        record.evidence.push(Evidence { verdict, round });
        record.score = scoring.score(&record.evidence).clamp(0.0, 1.0);
        record.last_round = round;
        if !rationale.is_null() {
            record.recent_rationales.push(rationale.clone());
            let len = record.recent_rationales.len();
            if len > GUIDANCE_DEPTH {
                record.recent_rationales.drain(..len - GUIDANCE_DEPTH);
            }
        }

        debug!(
            tag = %tag,
            verdict = %verdict,
            score = record.score,
            evidence = record.evidence.len(),
            "Weakness record updated"
        );
    }

    /// The `k` weakest tags: score descending, ties broken by lexical tag
    /// order, then earliest last-updated round. Deterministic and pure.
    pub fn top(&self, k: usize) -> Vec<WeaknessTag> {
        let records = self.records.lock().expect("weakness store poisoned");
        let mut ranked: Vec<(&WeaknessTag, f64, u32)> = records
            .values()
            .map(|r| (&r.tag, r.score, r.last_round))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
                .then_with(|| a.2.cmp(&b.2))
        });
        ranked.into_iter().take(k).map(|(t, _, _)| t.clone()).collect()
    }

    /// Snapshot of all records, sorted like `top`.
    pub fn snapshot(&self) -> Vec<WeaknessRecord> {
        let records = self.records.lock().expect("weakness store poisoned");
        let mut all: Vec<WeaknessRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tag.cmp(&b.tag))
                .then_with(|| a.last_round.cmp(&b.last_round))
        });
        all
    }

    pub fn guidance_for(&self, tag: &WeaknessTag) -> Option<Value> {
        let records = self.records.lock().expect("weakness store poisoned");
        let record = records.get(tag)?;
        if record.recent_rationales.is_empty() {
            return None;
        }
        Some(Value::Array(record.recent_rationales.clone()))
    }
}

/// Counters for one slice of the run (a dimension tag or a difficulty tier).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SliceStats {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl SliceStats {
    fn record(&mut self, verdict: Verdict) {
        self.total += 1;
        match verdict {
            Verdict::Pass => self.passed += 1,
            _ => self.failed += 1,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        self.passed as f64 / self.total.max(1) as f64
    }
}

/// Aggregate run statistics, kept alongside the per-tag records. Untagged
/// (initial-round) results land here even though they feed no record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub by_tag: HashMap<String, SliceStats>,
    pub by_difficulty: HashMap<String, SliceStats>,
    pub total: SliceStats,
    pub invalid_cases: u32,
}

/// Consumes evaluation results, updates the store, answers ranked queries.
pub struct WeaknessAnalyzer {
    store: WeaknessStore,
    scoring: Box<dyn WeaknessScoring>,
    aggregate: Mutex<AggregateStats>,
    current_round: std::sync::atomic::AtomicU32,
}

impl WeaknessAnalyzer {
    pub fn new(store: WeaknessStore, scoring: Box<dyn WeaknessScoring>) -> Self {
        Self {
            store,
            scoring,
            aggregate: Mutex::new(AggregateStats::default()),
            current_round: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Tell the analyzer which round is in progress, so new evidence is
    /// stamped with the right round index.
    pub fn set_round(&self, round: u32) {
        self.current_round
            .store(round, std::sync::atomic::Ordering::SeqCst);
    }

    /// Absorb one finalized result.
    ///
    /// Per-tag records are updated for every implicated tag of a
    /// non-`invalid` result; every result also lands in the aggregate
    /// statistics. Calls are serialized by the store lock, so updates apply
    /// in finalization order.
    pub fn ingest(&self, result: &EvaluationResult) {
        let round = self.current_round.load(std::sync::atomic::Ordering::SeqCst);

        {
            let mut agg = self.aggregate.lock().expect("aggregate stats poisoned");
            if result.verdict == Verdict::Invalid {
                agg.invalid_cases += 1;
            } else {
                agg.total.record(result.verdict);
                agg.by_difficulty
                    .entry(result.tier.to_string())
                    .or_default()
                    .record(result.verdict);
                for tag in &result.weakness_tags {
                    agg.by_tag
                        .entry(tag.to_string())
                        .or_default()
                        .record(result.verdict);
                }
            }
        }

        if result.verdict == Verdict::Invalid {
            return;
        }
        for tag in &result.weakness_tags {
            self.store
                .absorb(tag, result.verdict, round, &result.rationale, &*self.scoring);
        }
    }

    /// The current `k` weakest tags. May return fewer than `k`.
    pub fn get_top_weaknesses(&self, k: usize) -> Vec<WeaknessTag> {
        self.store.top(k)
    }

    /// Evidence guidance for a tag, for weakness-targeted generation.
    pub fn guidance_for(&self, tag: &WeaknessTag) -> Option<Value> {
        self.store.guidance_for(tag)
    }

    /// Full ranked snapshot for the final report.
    pub fn snapshot(&self) -> Vec<WeaknessRecord> {
        self.store.snapshot()
    }

    pub fn aggregate(&self) -> AggregateStats {
        self.aggregate
            .lock()
            .expect("aggregate stats poisoned")
            .clone()
    }
}
