//! Platform status reporting and artifact submission.
//!
//! Status updates are fire-and-forget: failures are logged and never abort
//! the run. Artifact submission is different — a failure there is fatal to
//! the run's completion status, though already-recorded results stay
//! retrievable in memory.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::HarnessError;
use crate::report::FinalReport;

/// Run lifecycle stages reported to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RoundStart,
    RoundComplete,
    RunTerminated,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundStart => "round_start",
            Self::RoundComplete => "round_complete",
            Self::RunTerminated => "run_terminated",
        }
    }
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Report a lifecycle stage. Implementations must swallow transport
    /// failures — callers never handle an error here.
    async fn update_status(&self, stage: Stage, payload: Value);
}

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Submit the final report. A failure surfaces as `Submission`.
    async fn add_artifacts(&self, report: &FinalReport) -> Result<(), HarnessError>;
}

/// HTTP platform client implementing both seams.
pub struct HttpPlatform {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPlatform {
    pub fn new(base_url: impl Into<String>) -> Result<Self, HarnessError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| HarnessError::Configuration(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl StatusReporter for HttpPlatform {
    async fn update_status(&self, stage: Stage, payload: Value) {
        let url = format!("{}/status", self.base_url);
        let body = json!({"stage": stage.as_str(), "payload": payload});
        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(stage = stage.as_str(), "Status reported");
            }
            Ok(response) => {
                warn!(stage = stage.as_str(), status = %response.status(), "Status report rejected");
            }
            Err(e) => {
                warn!(stage = stage.as_str(), error = %e, "Status report failed");
            }
        }
    }
}

#[async_trait]
impl ArtifactSink for HttpPlatform {
    async fn add_artifacts(&self, report: &FinalReport) -> Result<(), HarnessError> {
        let url = format!("{}/artifacts", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(report)
            .send()
            .await
            .map_err(|e| HarnessError::Submission(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(HarnessError::Submission(format!(
                "platform returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Reporter for local runs: logs stages instead of calling out.
pub struct LogReporter;

#[async_trait]
impl StatusReporter for LogReporter {
    async fn update_status(&self, stage: Stage, payload: Value) {
        info!(stage = stage.as_str(), %payload, "Status update");
    }
}

#[async_trait]
impl ArtifactSink for LogReporter {
    async fn add_artifacts(&self, report: &FinalReport) -> Result<(), HarnessError> {
        info!(
            rounds = report.rounds.len(),
            reason = %report.termination_reason,
            "Final report (local run, not submitted)"
        );
        Ok(())
    }
}
