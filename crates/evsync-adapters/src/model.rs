use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_MODEL_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model reply carried no text block")]
    EmptyReply,
}

/// Text-in/text-out completion service. Prompts and reply parsing live with
/// the callers; implementations only move text.
#[async_trait]
pub trait ClassificationModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [WireMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Messages API client. No client-side retry; batch runners own that.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building model http client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ClassificationModel for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let body = MessagesBody {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: [WireMessage {
                role: "user",
                content: &request.user,
            }],
        };
        let span = info_span!("model_complete", model = %request.model);

        async {
            let resp = self
                .client
                .post(self.endpoint())
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ModelError::Api {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed: MessagesResponse = resp.json().await?;
            let text = parsed
                .content
                .into_iter()
                .find(|block| block.kind == "text")
                .and_then(|block| block.text)
                .ok_or(ModelError::EmptyReply)?;
            debug!(chars = text.len(), "model reply received");
            Ok(text)
        }
        .instrument(span)
        .await
    }
}

/// Remove one surrounding markdown code fence (optionally tagged `json`).
pub fn strip_code_fence(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.strip_prefix("json").unwrap_or(rest).trim_start();
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest;
    }
    body.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 256,
            system: "classify".into(),
            user: "[0] Yoga".into(),
        }
    }

    #[test]
    fn strips_tagged_and_bare_fences() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[1,2]\n```\n"), "[1,2]");
        assert_eq!(strip_code_fence("  {\"plain\":true} "), "{\"plain\":true}");
    }

    #[tokio::test]
    async fn posts_messages_and_returns_first_text_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .and(body_partial_json(json!({
                "model": "claude-sonnet-4-20250514",
                "system": "classify",
                "messages": [{ "role": "user", "content": "[0] Yoga" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{ "type": "text", "text": "{\"0\":\"Fitness & Sports\"}" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = AnthropicClient::new("test-key", Duration::from_secs(5))
            .unwrap()
            .with_base_url(server.uri());
        let text = client.complete(&request()).await.unwrap();
        assert_eq!(text, "{\"0\":\"Fitness & Sports\"}");
    }

    #[tokio::test]
    async fn api_errors_surface_status_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .expect(1)
            .mount(&server)
            .await;

        let client = AnthropicClient::new("k", Duration::from_secs(5))
            .unwrap()
            .with_base_url(server.uri());
        let err = client.complete(&request()).await.expect_err("overloaded");
        assert!(matches!(err, ModelError::Api { status: 529, .. }));
    }

    #[tokio::test]
    async fn reply_without_text_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "content": [] })))
            .mount(&server)
            .await;

        let client = AnthropicClient::new("k", Duration::from_secs(5))
            .unwrap()
            .with_base_url(server.uri());
        assert!(matches!(client.complete(&request()).await, Err(ModelError::EmptyReply)));
    }
}
