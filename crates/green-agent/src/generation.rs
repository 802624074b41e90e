//! Case-content synthesis seam.
//!
//! The harness never produces case wording itself — it asks an external
//! generation service for `{content, success_criteria}` pairs and retries
//! transient failures with bounded backoff before abandoning a slot.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::HarnessError;
use crate::model::{DifficultyTier, WeaknessTag};

/// What the generator asks the service for: either a tier-only slot (initial
/// round) or a weakness-targeted slot with evidence guidance.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub tier: DifficultyTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weakness_tag: Option<WeaknessTag>,
    /// Evidence context for the targeted weakness (mismatch rationales from
    /// earlier rounds). Null for initial-round slots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<Value>,
}

/// One synthesized case payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesizedCase {
    pub content: Value,
    pub success_criteria: Value,
}

/// External generation service.
#[async_trait]
pub trait CaseSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesizedCase, HarnessError>;
}

/// Call the synthesizer with bounded retries and exponential backoff.
///
/// `slot` is a human-readable label used in the skip log. Returns the last
/// error once `retries` attempts have failed.
pub async fn synthesize_with_retry(
    synthesizer: &dyn CaseSynthesizer,
    request: &SynthesisRequest,
    retries: u32,
    slot: &str,
) -> Result<SynthesizedCase, HarnessError> {
    let mut backoff = Duration::from_millis(200);
    let attempts = retries.max(1);
    let mut last_err = HarnessError::generation(slot, "no attempts made");

    for attempt in 1..=attempts {
        match synthesizer.synthesize(request).await {
            Ok(case) => return Ok(case),
            Err(e) => {
                warn!(slot, attempt, error = %e, "Synthesis attempt failed");
                last_err = e;
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        }
    }

    Err(last_err)
}

/// HTTP generation service client.
///
/// POSTs the synthesis request as JSON to `{base_url}/generate` and expects
/// a `{content, success_criteria}` body back.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSynthesizer {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, HarnessError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HarnessError::Configuration(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl CaseSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesizedCase, HarnessError> {
        let url = format!("{}/generate", self.base_url);
        let slot = request
            .weakness_tag
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_else(|| request.tier.to_string());

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| HarnessError::generation(&slot, format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HarnessError::generation(
                &slot,
                format!("service returned {}", response.status()),
            ));
        }

        response
            .json::<SynthesizedCase>()
            .await
            .map_err(|e| HarnessError::generation(&slot, format!("malformed response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Synthesizer that fails the first `fail_first` calls, then succeeds.
    struct FlakySynthesizer {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CaseSynthesizer for FlakySynthesizer {
        async fn synthesize(
            &self,
            _request: &SynthesisRequest,
        ) -> Result<SynthesizedCase, HarnessError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(HarnessError::generation("slot", "transient"))
            } else {
                Ok(SynthesizedCase {
                    content: serde_json::json!({"instruction": "ok"}),
                    success_criteria: serde_json::json!({}),
                })
            }
        }
    }

    fn request() -> SynthesisRequest {
        SynthesisRequest {
            tier: DifficultyTier::Easy,
            weakness_tag: None,
            guidance: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failure() {
        let synth = FlakySynthesizer {
            fail_first: 2,
            calls: AtomicU32::new(0),
        };
        let result = synthesize_with_retry(&synth, &request(), 3, "easy/0").await;
        assert!(result.is_ok());
        assert_eq!(synth.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded() {
        let synth = FlakySynthesizer {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let result = synthesize_with_retry(&synth, &request(), 3, "easy/0").await;
        assert!(matches!(result, Err(HarnessError::Generation { .. })));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 3);
    }
}
