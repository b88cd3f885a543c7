//! Scripted provider that replays recorded per-stage responses.
//!
//! Fixture format (JSON), keyed by stage name:
//!
//! ```json
//! {
//!   "intent": [{"task_type": "feature", "confidence": 0.9, "summary": "..."}],
//!   "plan": [{"error": "timeout"}, {"steps": [], "rationale": "..."}]
//! }
//! ```
//!
//! Each stage's replies are consumed in order; the last reply repeats once
//! the queue is down to one. An `{"error": ...}` entry simulates a provider
//! failure (`timeout`, `rate_limited`, `malformed`, `unavailable`).

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::domain::models::{StageId, TokenUsage};
use crate::domain::ports::{GenerativeProvider, ProviderError, ProviderRequest, ProviderResponse};

/// Simulated provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedFailure {
    Timeout,
    RateLimited,
    Malformed,
    Unavailable,
}

/// One recorded reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptedReply {
    Failure { error: ScriptedFailure },
    Output(serde_json::Value),
}

impl ScriptedReply {
    pub fn output(value: serde_json::Value) -> Self {
        Self::Output(value)
    }

    pub fn failure(error: ScriptedFailure) -> Self {
        Self::Failure { error }
    }
}

/// Replays fixture replies per stage and records every request it receives.
pub struct ScriptedProvider {
    scripts: RwLock<HashMap<StageId, VecDeque<ScriptedReply>>>,
    requests: RwLock<Vec<ProviderRequest>>,
    /// Characters per streamed delta.
    stream_chunk_chars: usize,
    /// Pause between streamed deltas.
    stream_delay: Duration,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
            requests: RwLock::new(Vec::new()),
            stream_chunk_chars: 24,
            stream_delay: Duration::ZERO,
        }
    }

    pub fn with_streaming(mut self, chunk_chars: usize, delay: Duration) -> Self {
        self.stream_chunk_chars = chunk_chars.max(1);
        self.stream_delay = delay;
        self
    }

    /// Build from a fixture value keyed by stage name.
    pub fn from_fixture(fixture: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let parsed: HashMap<String, Vec<ScriptedReply>> = serde_json::from_value(fixture.clone())?;
        let mut scripts = HashMap::new();
        for (name, replies) in parsed {
            let stage = StageId::from_str(&name).ok_or_else(|| {
                <serde_json::Error as serde::de::Error>::custom(format!(
                    "unknown stage '{name}' in fixture"
                ))
            })?;
            scripts.insert(stage, replies.into_iter().collect::<VecDeque<_>>());
        }
        Ok(Self {
            scripts: RwLock::new(scripts),
            ..Self::new()
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read fixture {}", path.as_ref().display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid fixture JSON in {}", path.as_ref().display()))?;
        Self::from_fixture(&value).context("Fixture does not match the stage reply format")
    }

    /// Queue a reply for a stage.
    pub async fn push(&self, stage: StageId, reply: ScriptedReply) {
        let mut scripts = self.scripts.write().await;
        scripts.entry(stage).or_default().push_back(reply);
    }

    pub async fn push_output(&self, stage: StageId, value: serde_json::Value) {
        self.push(stage, ScriptedReply::Output(value)).await;
    }

    /// Number of requests received for a stage.
    pub async fn calls(&self, stage: StageId) -> usize {
        let requests = self.requests.read().await;
        requests.iter().filter(|r| r.stage == stage).count()
    }

    /// Requests received for a stage, in order.
    pub async fn requests(&self, stage: StageId) -> Vec<ProviderRequest> {
        let requests = self.requests.read().await;
        requests.iter().filter(|r| r.stage == stage).cloned().collect()
    }

    async fn next_reply(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.write().await.push(request.clone());

        let reply = {
            let mut scripts = self.scripts.write().await;
            let queue = scripts.get_mut(&request.stage);
            match queue {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(ScriptedReply::Output(value)) => {
                let usage = estimate_usage(request, &value);
                Ok(ProviderResponse::new(value, usage))
            }
            Some(ScriptedReply::Failure { error }) => Err(match error {
                ScriptedFailure::Timeout => ProviderError::Timeout(30_000),
                ScriptedFailure::RateLimited => ProviderError::RateLimited {
                    retry_after_ms: None,
                },
                ScriptedFailure::Malformed => {
                    ProviderError::SchemaParseFailure("scripted malformed output".to_string())
                }
                ScriptedFailure::Unavailable => {
                    ProviderError::Unavailable("scripted outage".to_string())
                }
            }),
            None => Err(ProviderError::Unavailable(format!(
                "no scripted reply for stage {}",
                request.stage
            ))),
        }
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Rough token counts so metrics have something to show.
fn estimate_usage(request: &ProviderRequest, output: &serde_json::Value) -> TokenUsage {
    let input_chars = request.system_prompt.len() + request.user_prompt.len();
    let output_chars = output.to_string().len();
    TokenUsage::new((input_chars / 4) as u64, (output_chars / 4) as u64)
}

#[async_trait]
impl GenerativeProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.next_reply(&request).await
    }

    async fn generate_streaming(
        &self,
        request: ProviderRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ProviderResponse, ProviderError> {
        let response = self.next_reply(&request).await?;
        let rendered = response.output.to_string();
        let chars: Vec<char> = rendered.chars().collect();

        for piece in chars.chunks(self.stream_chunk_chars) {
            if !self.stream_delay.is_zero() {
                tokio::time::sleep(self.stream_delay).await;
            }
            if deltas.send(piece.iter().collect()).await.is_err() {
                break;
            }
        }

        Ok(response)
    }
}
