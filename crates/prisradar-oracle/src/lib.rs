//! Text-reasoning oracle interface for prisradar.
//!
//! Callers hand over an instruction plus a strict JSON schema and get back
//! either a conforming value or an `OracleError`.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

pub mod client;
pub mod schema;

pub use client::{OpenAiCompatibleClient, OracleClientConfig};
pub use schema::{strip_code_blocks, StructuredOutput};

pub const CRATE_NAME: &str = "prisradar-oracle";

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle is not configured: {0}")]
    NotConfigured(String),
    #[error("oracle rate limited")]
    RateLimited,
    #[error("oracle call timed out")]
    Timeout,
    #[error("oracle api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("oracle network error: {0}")]
    Network(String),
    #[error("oracle output does not match schema {schema}: {message}")]
    Schema { schema: String, message: String },
}

/// One structured-output call.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRequest {
    pub system: String,
    pub user: String,
    pub schema_name: String,
    pub schema: Value,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Returns the raw JSON value the model produced for `request.schema`.
    async fn complete(&self, request: &StructuredRequest) -> Result<Value, OracleError>;
}

/// Builds the request from `T`'s schema and deserializes the answer into `T`.
pub async fn extract<T: StructuredOutput>(
    oracle: &dyn Oracle,
    schema_name: &str,
    system: impl Into<String>,
    user: impl Into<String>,
) -> Result<T, OracleError> {
    let request = StructuredRequest {
        system: system.into(),
        user: user.into(),
        schema_name: schema_name.to_string(),
        schema: T::strict_schema(),
    };
    let value = oracle.complete(&request).await?;
    serde_json::from_value(value).map_err(|e| OracleError::Schema {
        schema: schema_name.to_string(),
        message: e.to_string(),
    })
}

/// Oracle that replays queued answers per schema name. Used by tests and by
/// offline runs that must not reach a model provider.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    answers: Mutex<HashMap<String, VecDeque<Result<Value, OracleError>>>>,
    requests: Mutex<Vec<StructuredRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, schema_name: &str, answer: Result<Value, OracleError>) {
        self.answers
            .lock()
            .await
            .entry(schema_name.to_string())
            .or_default()
            .push_back(answer);
    }

    pub async fn requests(&self) -> Vec<StructuredRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(&self, request: &StructuredRequest) -> Result<Value, OracleError> {
        self.requests.lock().await.push(request.clone());
        self.answers
            .lock()
            .await
            .get_mut(&request.schema_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(OracleError::NotConfigured(format!(
                    "no scripted answer for {}",
                    request.schema_name
                )))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Verdict {
        ok: bool,
    }

    #[tokio::test]
    async fn extract_deserializes_conforming_answers() {
        let oracle = ScriptedOracle::new();
        oracle.push("verdict", Ok(json!({ "ok": true }))).await;
        let verdict: Verdict = extract(&oracle, "verdict", "system", "user").await.unwrap();
        assert_eq!(verdict, Verdict { ok: true });

        let sent = oracle.requests().await;
        assert_eq!(sent[0].schema_name, "verdict");
        assert_eq!(sent[0].schema["additionalProperties"], json!(false));
    }

    #[tokio::test]
    async fn non_conforming_answer_is_a_schema_error() {
        let oracle = ScriptedOracle::new();
        oracle.push("verdict", Ok(json!({ "ok": "maybe" }))).await;
        let err = extract::<Verdict>(&oracle, "verdict", "s", "u").await.unwrap_err();
        assert!(matches!(err, OracleError::Schema { .. }));
    }

    #[tokio::test]
    async fn unscripted_call_fails_without_panicking() {
        let oracle = ScriptedOracle::new();
        let err = extract::<Verdict>(&oracle, "verdict", "s", "u").await.unwrap_err();
        assert!(matches!(err, OracleError::NotConfigured(_)));
        assert_eq!(oracle.call_count().await, 1);
    }
}
