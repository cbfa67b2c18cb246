//! Chat-completions client speaking the OpenAI `json_schema` response format.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info_span, Instrument};

use crate::schema::strip_code_blocks;
use crate::{Oracle, OracleError, StructuredRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OracleClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl OracleClientConfig {
    /// Reads `ORACLE_API_KEY`, `ORACLE_BASE_URL` and `ORACLE_MODEL`.
    pub fn from_env() -> Result<Self, OracleError> {
        let api_key = std::env::var("ORACLE_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| OracleError::NotConfigured("ORACLE_API_KEY is not set".into()))?;
        Ok(Self {
            api_key,
            base_url: std::env::var("ORACLE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
            model: std::env::var("ORACLE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            timeout: Duration::from_secs(60),
        })
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    strict: bool,
    schema: &'a Value,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat<'a>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    config: OracleClientConfig,
}

impl OpenAiCompatibleClient {
    pub fn new(config: OracleClientConfig) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OracleError::NotConfigured(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> Result<Self, OracleError> {
        Self::new(OracleClientConfig::from_env()?)
    }

    fn headers(&self) -> Result<HeaderMap, OracleError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|e| OracleError::NotConfigured(e.to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn send(&self, request: &StructuredRequest) -> Result<Value, OracleError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                WireMessage {
                    role: "system",
                    content: &request.system,
                },
                WireMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: 0.1,
            response_format: ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: &request.schema_name,
                    strict: true,
                    schema: &request.schema,
                },
            },
        };

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(OracleError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let chat: ChatResponse = response.json().await.map_err(classify_transport)?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OracleError::Schema {
                schema: request.schema_name.clone(),
                message: "response has no content".into(),
            })?;

        serde_json::from_str(strip_code_blocks(&content)).map_err(|e| OracleError::Schema {
            schema: request.schema_name.clone(),
            message: e.to_string(),
        })
    }
}

fn classify_transport(err: reqwest::Error) -> OracleError {
    if err.is_timeout() {
        OracleError::Timeout
    } else {
        OracleError::Network(err.to_string())
    }
}

#[async_trait]
impl Oracle for OpenAiCompatibleClient {
    async fn complete(&self, request: &StructuredRequest) -> Result<Value, OracleError> {
        let span = info_span!("oracle_call", schema = %request.schema_name, model = %self.config.model);
        async {
            debug!("sending structured output request");
            self.send(request).await
        }
        .instrument(span)
        .await
    }
}
