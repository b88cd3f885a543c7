//! Generative provider port - interface for the text generation backend.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::ProviderError;
use crate::domain::models::{StageId, TokenUsage};

/// Structured prompt plus the schema the response must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub stage: StageId,
    pub system_prompt: String,
    pub user_prompt: String,
    /// JSON schema of the expected response.
    pub schema: serde_json::Value,
}

impl ProviderRequest {
    pub fn new(stage: StageId, system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            stage,
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            schema: serde_json::Value::Null,
        }
    }

    /// Attach the JSON schema generated from `T`.
    pub fn expecting<T: JsonSchema>(mut self) -> Self {
        self.schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default();
        self
    }
}

/// Parsed structured output plus usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub output: serde_json::Value,
    pub usage: TokenUsage,
}

impl ProviderResponse {
    pub fn new(output: serde_json::Value, usage: TokenUsage) -> Self {
        Self { output, usage }
    }

    /// Deserialize the output into the stage's expected shape.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProviderError> {
        serde_json::from_value(self.output.clone())
            .map_err(|e| ProviderError::SchemaParseFailure(e.to_string()))
    }
}

/// Trait for generative provider implementations.
///
/// Prompt transport and token accounting live behind this trait; stages only
/// see structured requests and responses.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Run one generation to completion.
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Run one generation, sending incremental text deltas while it proceeds.
    ///
    /// The sender is dropped when generation ends. Providers without native
    /// streaming emit the serialized output as a single delta.
    async fn generate_streaming(
        &self,
        request: ProviderRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<ProviderResponse, ProviderError> {
        let response = self.generate(request).await?;
        let _ = deltas.send(response.output.to_string()).await;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Answer {
        #[allow(dead_code)]
        value: u32,
    }

    #[test]
    fn test_request_carries_schema() {
        let request = ProviderRequest::new(StageId::Plan, "sys", "user").expecting::<Answer>();
        assert_eq!(request.schema["title"], "Answer");
        assert!(request.schema["properties"]["value"].is_object());
    }

    #[test]
    fn test_parse_mismatch_is_schema_failure() {
        let response = ProviderResponse::new(serde_json::json!({"other": 1}), TokenUsage::default());
        assert!(matches!(
            response.parse::<Answer>(),
            Err(ProviderError::SchemaParseFailure(_))
        ));
    }
}
