use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Categorized failure modes of the responses API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorCode {
    InvalidInput,
    InvalidApiKey,
    NotFound,
    RateLimit,
    ServerError,
    Timeout,
    Network,
    EmptyResponse,
    NoMessageOutput,
}

impl LlmErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorCode::InvalidInput => "INVALID_INPUT",
            LlmErrorCode::InvalidApiKey => "INVALID_API_KEY",
            LlmErrorCode::NotFound => "NOT_FOUND",
            LlmErrorCode::RateLimit => "RATE_LIMIT",
            LlmErrorCode::ServerError => "SERVER_ERROR",
            LlmErrorCode::Timeout => "TIMEOUT",
            LlmErrorCode::Network => "NETWORK",
            LlmErrorCode::EmptyResponse => "EMPTY_RESPONSE",
            LlmErrorCode::NoMessageOutput => "NO_MESSAGE_OUTPUT",
        }
    }

    /// Worth another attempt inside the client's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmErrorCode::RateLimit
                | LlmErrorCode::ServerError
                | LlmErrorCode::Timeout
                | LlmErrorCode::Network
        )
    }
}

#[derive(Debug, Error)]
#[error("llm call failed ({}): {message}", .code.as_str())]
pub struct LlmError {
    pub code: LlmErrorCode,
    pub message: String,
}

impl LlmError {
    pub fn new(code: LlmErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A successful model turn.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub tokens_used: u64,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub message_text: String,
    pub conversation_id: Option<String>,
    pub prompt_id: String,
    pub user_id: Option<String>,
}

/// Seam for the worker; the production implementation is [`LlmClient`].
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn call(&self, request: &LlmRequest) -> Result<LlmReply, LlmError>;
    async fn create_conversation(&self) -> Result<String, LlmError>;
}

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Attempts per call, clamped to 1..=5.
    pub max_retries: u32,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Exponential backoff with 10% jitter, capped at 30s.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64.saturating_mul(2u64.saturating_pow(attempt));
    let capped = base_ms.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=(capped / 10).max(1));
    Duration::from_millis(capped + jitter)
}

// Wire shapes of the responses API.

#[derive(Debug, Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    output: Vec<OutputItem>,
    usage: Option<Usage>,
    conversation: Option<ConversationRef>,
    #[allow(dead_code)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ConversationRef {
    id: String,
}

fn extract_reply(body: ResponsesBody) -> Result<LlmReply, LlmError> {
    let text = body
        .output
        .iter()
        .find(|item| item.kind == "message")
        .ok_or_else(|| LlmError::new(LlmErrorCode::NoMessageOutput, "no message in output"))?
        .content
        .iter()
        .find(|c| c.kind == "output_text")
        .and_then(|c| c.text.clone())
        .ok_or_else(|| LlmError::new(LlmErrorCode::NoMessageOutput, "no output_text content"))?;

    if text.trim().is_empty() {
        return Err(LlmError::new(LlmErrorCode::EmptyResponse, "empty model reply"));
    }

    Ok(LlmReply {
        text,
        tokens_used: body.usage.and_then(|u| u.total_tokens).unwrap_or(0),
        conversation_id: body.conversation.map(|c| c.id),
    })
}

fn map_status(status: reqwest::StatusCode, detail: &str) -> LlmError {
    let code = match status.as_u16() {
        400 => LlmErrorCode::InvalidInput,
        401 | 403 => LlmErrorCode::InvalidApiKey,
        404 => LlmErrorCode::NotFound,
        429 => LlmErrorCode::RateLimit,
        s if s >= 500 => LlmErrorCode::ServerError,
        _ => LlmErrorCode::InvalidInput,
    };
    LlmError::new(code, format!("http {}: {}", status.as_u16(), detail))
}

fn map_transport(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::new(LlmErrorCode::Timeout, err.to_string())
    } else {
        LlmError::new(LlmErrorCode::Network, err.to_string())
    }
}

/// Typed client for the external responses API with per-call timeout and
/// rate-limit-aware multi-attempt retry.
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmClientConfig,
}

impl LlmClient {
    pub fn new(config: LlmClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn attempts(&self) -> u32 {
        self.config.max_retries.clamp(1, 5)
    }

    async fn call_once(&self, request: &LlmRequest) -> Result<LlmReply, LlmError> {
        let mut body = json!({
            "prompt": { "id": request.prompt_id },
            "input": [{ "role": "user", "content": request.message_text }],
        });
        if let Some(conversation) = &request.conversation_id {
            body["conversation"] = json!(conversation);
        }
        if let Some(user) = &request.user_id {
            body["user"] = json!(user);
        }

        let response = self
            .http
            .post(format!("{}/responses", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(map_status(status, &detail));
        }

        let parsed: ResponsesBody = response
            .json()
            .await
            .map_err(|e| LlmError::new(LlmErrorCode::Network, e.to_string()))?;
        extract_reply(parsed)
    }

    /// Latency of a throwaway conversation create; used as a health signal.
    pub async fn connection_test(&self) -> Result<Duration, LlmError> {
        let started = Instant::now();
        let id = self.create_conversation().await?;
        let latency = started.elapsed();
        debug!(conversation_id = %id, latency_ms = latency.as_millis() as u64, "llm connection test ok");
        Ok(latency)
    }
}

#[async_trait]
impl LlmService for LlmClient {
    async fn call(&self, request: &LlmRequest) -> Result<LlmReply, LlmError> {
        let attempts = self.attempts();
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.call_once(request).await {
                Ok(reply) => {
                    if attempt > 0 {
                        info!(attempt, "llm call recovered after retry");
                    }
                    return Ok(reply);
                }
                Err(err) if err.code.is_retryable() && attempt + 1 < attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        code = err.code.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "llm call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| LlmError::new(LlmErrorCode::ServerError, "retries exhausted")))
    }

    async fn create_conversation(&self) -> Result<String, LlmError> {
        let response = self
            .http
            .post(format!("{}/conversations", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({}))
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(map_status(status, &detail));
        }
        let created: ConversationRef = response
            .json()
            .await
            .map_err(|e| LlmError::new(LlmErrorCode::Network, e.to_string()))?;
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_by_code() {
        assert!(LlmErrorCode::RateLimit.is_retryable());
        assert!(LlmErrorCode::ServerError.is_retryable());
        assert!(LlmErrorCode::Timeout.is_retryable());
        assert!(LlmErrorCode::Network.is_retryable());
        assert!(!LlmErrorCode::InvalidApiKey.is_retryable());
        assert!(!LlmErrorCode::NotFound.is_retryable());
        assert!(!LlmErrorCode::InvalidInput.is_retryable());
        assert!(!LlmErrorCode::NoMessageOutput.is_retryable());
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(0) >= Duration::from_millis(1000));
        assert!(backoff_delay(0) < Duration::from_millis(1200));
        assert!(backoff_delay(3) >= Duration::from_millis(8000));
        // Attempt 10 would be 1024s uncapped.
        assert!(backoff_delay(10) <= Duration::from_millis(33_000));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            map_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "").code,
            LlmErrorCode::RateLimit
        );
        assert_eq!(
            map_status(reqwest::StatusCode::UNAUTHORIZED, "").code,
            LlmErrorCode::InvalidApiKey
        );
        assert_eq!(
            map_status(reqwest::StatusCode::NOT_FOUND, "").code,
            LlmErrorCode::NotFound
        );
        assert_eq!(
            map_status(reqwest::StatusCode::BAD_GATEWAY, "").code,
            LlmErrorCode::ServerError
        );
        assert_eq!(
            map_status(reqwest::StatusCode::BAD_REQUEST, "").code,
            LlmErrorCode::InvalidInput
        );
    }

    #[test]
    fn reply_extraction_from_responses_shape() {
        let body: ResponsesBody = serde_json::from_value(json!({
            "status": "completed",
            "output": [
                { "type": "reasoning", "content": [] },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "Hi!" }
                ]}
            ],
            "usage": { "total_tokens": 10 },
            "conversation": { "id": "conv_abc" }
        }))
        .unwrap();

        let reply = extract_reply(body).unwrap();
        assert_eq!(reply.text, "Hi!");
        assert_eq!(reply.tokens_used, 10);
        assert_eq!(reply.conversation_id.as_deref(), Some("conv_abc"));
    }

    #[test]
    fn missing_message_output_is_an_error() {
        let body: ResponsesBody = serde_json::from_value(json!({
            "output": [{ "type": "reasoning", "content": [] }]
        }))
        .unwrap();
        assert_eq!(
            extract_reply(body).unwrap_err().code,
            LlmErrorCode::NoMessageOutput
        );
    }

    #[test]
    fn blank_text_is_empty_response() {
        let body: ResponsesBody = serde_json::from_value(json!({
            "output": [
                { "type": "message", "content": [
                    { "type": "output_text", "text": "   " }
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(
            extract_reply(body).unwrap_err().code,
            LlmErrorCode::EmptyResponse
        );
    }
}
