//! Adaptive test-case generation.
//!
//! Round 1 spreads cases across difficulty tiers in a pyramid (most at the
//! easiest tier, fewest at the hardest) with no weakness bias. Every later
//! round targets the analyzer's current top-k weaknesses, `m` cases per tag,
//! carrying recent mismatch evidence as generation guidance.
//!
//! A slot whose synthesis keeps failing is skipped and logged, never
//! silently duplicated — short rounds are legal output and the loop must
//! tolerate them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::generation::{synthesize_with_retry, CaseSynthesizer, SynthesisRequest};
use crate::model::{CaseId, DifficultyTier, TestCase, TestRound, WeaknessTag};

/// Produces rounds of test cases. No weakness-store access; its only side
/// effects are calls to the generation service.
pub struct AdaptiveGenerator {
    synthesizer: Arc<dyn CaseSynthesizer>,
    retries: u32,
}

/// Pyramid allocation of `n` cases across the ordered tiers.
///
/// Tier weights descend from easiest to hardest (3 tiers → 3:2:1), so the
/// per-tier counts are non-increasing and sum exactly to `n`. Remainders go
/// to the easiest tiers first, which preserves the shape.
pub fn pyramid_allocation(n: usize) -> Vec<(DifficultyTier, usize)> {
    let tiers = DifficultyTier::ALL;
    let weights: Vec<usize> = (1..=tiers.len()).rev().collect();
    let total: usize = weights.iter().sum();

    let mut counts: Vec<usize> = weights.iter().map(|w| n * w / total).collect();
    let mut remainder = n - counts.iter().sum::<usize>();
    for count in counts.iter_mut() {
        if remainder == 0 {
            break;
        }
        *count += 1;
        remainder -= 1;
    }

    tiers.into_iter().zip(counts).collect()
}

impl AdaptiveGenerator {
    pub fn new(synthesizer: Arc<dyn CaseSynthesizer>, retries: u32) -> Self {
        Self {
            synthesizer,
            retries,
        }
    }

    /// Generate the weakness-free initial round of `n` cases.
    pub async fn generate_initial_round(&self, round_index: u32, n: usize) -> TestRound {
        let mut cases = Vec::with_capacity(n);
        let mut ordinal = 0usize;

        for (tier, count) in pyramid_allocation(n) {
            for slot in 0..count {
                let slot_label = format!("round{round_index}/{tier}/{slot}");
                let request = SynthesisRequest {
                    tier,
                    weakness_tag: None,
                    guidance: None,
                };
                match synthesize_with_retry(&*self.synthesizer, &request, self.retries, &slot_label)
                    .await
                {
                    Ok(synthesized) => {
                        cases.push(TestCase {
                            id: CaseId::new(round_index, ordinal),
                            weakness_tag: None,
                            tier,
                            content: synthesized.content,
                            success_criteria: synthesized.success_criteria,
                        });
                        ordinal += 1;
                    }
                    Err(e) => {
                        warn!(slot = %slot_label, error = %e, "Slot skipped after retries");
                    }
                }
            }
        }

        info!(
            round = round_index,
            requested = n,
            generated = cases.len(),
            "Initial round generated"
        );
        TestRound {
            index: round_index,
            cases,
        }
    }

    /// Generate a weakness-targeted round: `cases_per_tag` cases for each
    /// tag, preserving the caller-supplied tag order. `guidance` carries
    /// per-tag evidence context from the analyzer.
    pub async fn generate_round(
        &self,
        round_index: u32,
        targets: &[WeaknessTag],
        cases_per_tag: usize,
        guidance: &HashMap<WeaknessTag, Value>,
    ) -> TestRound {
        let mut cases = Vec::with_capacity(targets.len() * cases_per_tag);
        let mut ordinal = 0usize;

        for tag in targets {
            let mut generated_for_tag = 0usize;
            for slot in 0..cases_per_tag {
                // Probe the weakness across the tier ladder rather than at a
                // single difficulty.
                let tier = DifficultyTier::ALL[slot % DifficultyTier::ALL.len()];
                let slot_label = format!("round{round_index}/{tag}/{slot}");
                let request = SynthesisRequest {
                    tier,
                    weakness_tag: Some(tag.clone()),
                    guidance: guidance.get(tag).cloned(),
                };
                match synthesize_with_retry(&*self.synthesizer, &request, self.retries, &slot_label)
                    .await
                {
                    Ok(synthesized) => {
                        cases.push(TestCase {
                            id: CaseId::new(round_index, ordinal),
                            weakness_tag: Some(tag.clone()),
                            tier,
                            content: synthesized.content,
                            success_criteria: synthesized.success_criteria,
                        });
                        ordinal += 1;
                        generated_for_tag += 1;
                    }
                    Err(e) => {
                        warn!(slot = %slot_label, error = %e, "Slot skipped after retries");
                    }
                }
            }
            if generated_for_tag == 0 {
                warn!(tag = %tag, round = round_index, "Tag skipped for this round");
            }
        }

        info!(
            round = round_index,
            targets = targets.len(),
            generated = cases.len(),
            "Targeted round generated"
        );
        TestRound {
            index: round_index,
            cases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HarnessError;
    use crate::generation::SynthesizedCase;
    use async_trait::async_trait;
    use serde_json::json;

    /// Deterministic synthesizer; fails every request whose tag is listed.
    struct ScriptedSynthesizer {
        failing_tags: Vec<&'static str>,
    }

    #[async_trait]
    impl CaseSynthesizer for ScriptedSynthesizer {
        async fn synthesize(
            &self,
            request: &SynthesisRequest,
        ) -> Result<SynthesizedCase, HarnessError> {
            if let Some(tag) = &request.weakness_tag {
                if self.failing_tags.contains(&tag.as_str()) {
                    return Err(HarnessError::generation(tag.as_str(), "service refused"));
                }
            }
            Ok(SynthesizedCase {
                content: json!({"instruction": format!("case for {}", request.tier)}),
                success_criteria: json!({"expected_actions": [], "expected_final_state": {}}),
            })
        }
    }

    fn generator(failing_tags: Vec<&'static str>) -> AdaptiveGenerator {
        AdaptiveGenerator::new(Arc::new(ScriptedSynthesizer { failing_tags }), 2)
    }

    #[test]
    fn pyramid_six_over_three_tiers() {
        let alloc = pyramid_allocation(6);
        assert_eq!(
            alloc,
            vec![
                (DifficultyTier::Easy, 3),
                (DifficultyTier::Medium, 2),
                (DifficultyTier::Hard, 1),
            ]
        );
    }

    #[test]
    fn pyramid_is_non_increasing_and_sums_to_n() {
        for n in 1..=30 {
            let alloc = pyramid_allocation(n);
            let counts: Vec<usize> = alloc.iter().map(|(_, c)| *c).collect();
            assert_eq!(counts.iter().sum::<usize>(), n, "n={n}");
            assert!(
                counts.windows(2).all(|w| w[0] >= w[1]),
                "n={n} counts={counts:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initial_round_has_no_tags() {
        let round = generator(vec![]).generate_initial_round(1, 6).await;
        assert_eq!(round.cases.len(), 6);
        assert!(round.cases.iter().all(|c| c.weakness_tag.is_none()));
        // Ordered easiest-first per the pyramid
        assert_eq!(round.cases[0].tier, DifficultyTier::Easy);
        assert_eq!(round.cases[5].tier, DifficultyTier::Hard);
    }

    #[tokio::test(start_paused = true)]
    async fn targeted_round_preserves_tag_order() {
        let tags = vec![WeaknessTag::from("noise"), WeaknessTag::from("conflict")];
        let round = generator(vec![])
            .generate_round(2, &tags, 2, &HashMap::new())
            .await;
        assert_eq!(round.cases.len(), 4);
        assert_eq!(round.cases[0].weakness_tag, Some(WeaknessTag::from("noise")));
        assert_eq!(round.cases[1].weakness_tag, Some(WeaknessTag::from("noise")));
        assert_eq!(
            round.cases[2].weakness_tag,
            Some(WeaknessTag::from("conflict"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_tag_is_skipped_and_round_is_short() {
        let tags = vec![WeaknessTag::from("A"), WeaknessTag::from("B")];
        let round = generator(vec!["B"])
            .generate_round(2, &tags, 4, &HashMap::new())
            .await;
        assert_eq!(round.cases.len(), 4);
        assert!(round
            .cases
            .iter()
            .all(|c| c.weakness_tag == Some(WeaknessTag::from("A"))));
    }

    #[tokio::test(start_paused = true)]
    async fn case_ids_are_unique_within_round() {
        let round = generator(vec![]).generate_initial_round(1, 12).await;
        let mut ids: Vec<&str> = round.cases.iter().map(|c| c.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 12);
    }
}
