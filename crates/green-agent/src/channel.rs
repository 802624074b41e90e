//! Interaction channel to the subject ("purple") agent.
//!
//! `dispatch` hands a case to the subject agent and returns a receiver over
//! its execution turns. The stream is open-ended: it closes when the channel
//! signals case completion, or when the caller drops the receiver (the
//! orchestrator's per-case timeout).
//!
//! The HTTP implementation speaks a JSON-RPC task protocol: `tasks/send`
//! submits the case, then `tasks/get` is polled until the task reaches a
//! terminal state, with each poll's new artifact parts surfaced as turns.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::HarnessError;
use crate::model::{CaseId, ExecutionTurn, TestCase};

/// Channel depth per case; the evaluator drains promptly, so a small buffer
/// is enough to absorb polling bursts.
const TURN_BUFFER: usize = 16;

#[async_trait]
pub trait InteractionChannel: Send + Sync {
    /// Dispatch a case and stream back its execution turns.
    async fn dispatch(
        &self,
        case: &TestCase,
    ) -> Result<mpsc::Receiver<ExecutionTurn>, HarnessError>;
}

/// JSON-RPC polling client for the subject agent.
pub struct JsonRpcChannel {
    client: reqwest::Client,
    endpoint: String,
    poll_interval: Duration,
}

impl JsonRpcChannel {
    pub fn new(endpoint: impl Into<String>, poll_interval: Duration) -> Result<Self, HarnessError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HarnessError::Configuration(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            poll_interval,
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, String> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("{method} request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("{method} returned {}", response.status()));
        }
        let reply: Value = response
            .json()
            .await
            .map_err(|e| format!("{method} returned malformed JSON: {e}"))?;
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| format!("{method} reply missing result"))
    }
}

#[async_trait]
impl InteractionChannel for JsonRpcChannel {
    async fn dispatch(
        &self,
        case: &TestCase,
    ) -> Result<mpsc::Receiver<ExecutionTurn>, HarnessError> {
        let instruction = case
            .content
            .get("instruction")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let sent = self
            .rpc(
                "tasks/send",
                json!({
                    "message": {"parts": [{"text": instruction}]},
                }),
            )
            .await
            .map_err(|e| HarnessError::channel(case.id.as_str(), e))?;
        let task_id = sent
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| HarnessError::channel(case.id.as_str(), "tasks/send reply missing id"))?
            .to_string();

        debug!(case_id = %case.id, task_id, "Case dispatched");

        let (tx, rx) = mpsc::channel(TURN_BUFFER);
        let pump = Pump {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            poll_interval: self.poll_interval,
            case_id: case.id.clone(),
            task_id,
        };
        tokio::spawn(pump.run(tx));

        Ok(rx)
    }
}

/// Background poller: converts task polling into a turn stream.
struct Pump {
    client: reqwest::Client,
    endpoint: String,
    poll_interval: Duration,
    case_id: CaseId,
    task_id: String,
}

impl Pump {
    async fn run(self, tx: mpsc::Sender<ExecutionTurn>) {
        let mut seq: u32 = 0;
        let mut parts_seen: usize = 0;

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let task = match self.poll().await {
                Ok(task) => task,
                Err(e) => {
                    // Stream ends without a terminal turn; the orchestrator
                    // converts the silence into a timeout verdict.
                    warn!(case_id = %self.case_id, error = e, "Poll failed, closing turn stream");
                    return;
                }
            };

            let state = task
                .pointer("/status/state")
                .and_then(Value::as_str)
                .unwrap_or("working")
                .to_string();
            let (actions, final_state) = parse_artifacts(&task, &mut parts_seen);

            let terminal = matches!(state.as_str(), "completed" | "failed");
            if !terminal && actions.is_empty() {
                continue;
            }

            let mut observation = json!({"status": if terminal { state.as_str() } else { "working" }});
            if let Some(fs) = final_state {
                observation["final_state"] = fs;
            }

            let turn = ExecutionTurn {
                case_id: self.case_id.clone(),
                seq,
                action: Value::Array(actions),
                observation,
                timestamp: Utc::now(),
            };
            seq += 1;

            if tx.send(turn).await.is_err() {
                // Receiver dropped — case timed out or run cancelled.
                return;
            }
            if terminal {
                return;
            }
        }
    }

    async fn poll(&self) -> Result<Value, String> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tasks/get",
            "params": {"id": self.task_id},
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("tasks/get request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("tasks/get returned {}", response.status()));
        }
        let reply: Value = response
            .json()
            .await
            .map_err(|e| format!("tasks/get returned malformed JSON: {e}"))?;
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| "tasks/get reply missing result".to_string())
    }
}

/// Extract new action objects and the reported final state from the task's
/// artifact parts, skipping parts already surfaced in earlier polls.
///
/// Parts are text; those parsing as JSON objects with an `action` key become
/// actions, and an object with a `final_state` key supplies the state.
fn parse_artifacts(task: &Value, parts_seen: &mut usize) -> (Vec<Value>, Option<Value>) {
    let mut actions = Vec::new();
    let mut final_state = None;

    let parts: Vec<&Value> = task
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|artifacts| {
            artifacts
                .iter()
                .filter_map(|a| a.get("parts").and_then(Value::as_array))
                .flatten()
                .collect()
        })
        .unwrap_or_default();

    for part in parts.iter().skip(*parts_seen) {
        let Some(text) = part.get("text").and_then(Value::as_str) else {
            continue;
        };
        let Ok(parsed) = serde_json::from_str::<Value>(text) else {
            continue;
        };
        if parsed.get("action").is_some() {
            actions.push(parsed);
        } else if let Some(fs) = parsed.get("final_state") {
            final_state = Some(fs.clone());
        }
    }
    *parts_seen = parts.len();

    (actions, final_state)
}
