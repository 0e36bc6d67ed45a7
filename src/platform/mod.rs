pub mod live;

pub use live::{LiveEvent, LiveSessionHub};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::Platform;

/// Unified outbound error taxonomy across the three platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorCode {
    /// WhatsApp 24h customer-service window closed (error 131047).
    WindowExpired,
    /// Platform asked us to slow down.
    RateLimit,
    /// Instagram error 551: recipient cannot receive messages right now.
    UserUnavailable,
    InvalidToken,
    BadRequest,
    ServerError,
    Network,
}

impl SendErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendErrorCode::WindowExpired => "WINDOW_EXPIRED",
            SendErrorCode::RateLimit => "RATE_LIMIT",
            SendErrorCode::UserUnavailable => "USER_UNAVAILABLE",
            SendErrorCode::InvalidToken => "INVALID_TOKEN",
            SendErrorCode::BadRequest => "BAD_REQUEST",
            SendErrorCode::ServerError => "SERVER_ERROR",
            SendErrorCode::Network => "NETWORK",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendErrorCode::RateLimit
                | SendErrorCode::UserUnavailable
                | SendErrorCode::ServerError
                | SendErrorCode::Network
        )
    }
}

#[derive(Debug, Error)]
#[error("platform send failed ({}): {message}", .code.as_str())]
pub struct SendError {
    pub code: SendErrorCode,
    pub message: String,
}

impl SendError {
    pub fn new(code: SendErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub platform_message_id: Option<String>,
}

/// One outbound reply, with the credentials the session cache already
/// resolved so no extra DB hop is needed here.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub phone_number_id: String,
    pub customer_phone: String,
    pub text: String,
    pub platform: Platform,
    pub access_token: String,
    pub meta_phone_number_id: String,
}

/// Typing/mark-read signal for the platforms that support it.
#[derive(Debug, Clone)]
pub struct TypingIndicator {
    pub platform: Platform,
    pub customer_phone: String,
    pub access_token: String,
    pub meta_phone_number_id: String,
    /// Inbound platform message id to mark as read (WhatsApp).
    pub inbound_message_id: Option<String>,
}

/// Seam for the worker; the production implementation is [`PlatformClient`].
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome, SendError>;
    async fn send_typing_indicator(&self, indicator: &TypingIndicator) -> Result<(), SendError>;
}

#[derive(Debug, Clone)]
pub struct PlatformClientConfig {
    pub graph_base_url: String,
    /// Delivery endpoint for webchat transports; the live hub handles
    /// in-process push either way.
    pub webchat_delivery_url: Option<String>,
    pub timeout: Duration,
}

impl Default for PlatformClientConfig {
    fn default() -> Self {
        Self {
            graph_base_url: "https://graph.facebook.com/v21.0".to_string(),
            webchat_delivery_url: None,
            timeout: Duration::from_secs(15),
        }
    }
}

/// Trim to the platform limit on a char boundary.
pub fn truncate_for_platform(text: &str, platform: Platform) -> String {
    let limit = platform.max_message_len();
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}

fn whatsapp_payload(message: &OutboundMessage) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "to": message.customer_phone,
        "type": "text",
        "text": { "body": truncate_for_platform(&message.text, Platform::Whatsapp) }
    })
}

fn instagram_payload(message: &OutboundMessage) -> Value {
    json!({
        "recipient": { "id": message.customer_phone },
        "message": { "text": truncate_for_platform(&message.text, Platform::Instagram) }
    })
}

/// Map a Graph API error body (and HTTP status) onto the unified taxonomy.
fn map_graph_error(status: reqwest::StatusCode, body: &str) -> SendError {
    let graph_code = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["code"].as_i64());

    let code = match graph_code {
        Some(131047) => SendErrorCode::WindowExpired,
        Some(551) => SendErrorCode::UserUnavailable,
        Some(190) => SendErrorCode::InvalidToken,
        Some(4) | Some(613) => SendErrorCode::RateLimit,
        _ if status.as_u16() == 429 => SendErrorCode::RateLimit,
        _ if status.as_u16() == 401 || status.as_u16() == 403 => SendErrorCode::InvalidToken,
        _ if status.is_server_error() => SendErrorCode::ServerError,
        _ => SendErrorCode::BadRequest,
    };
    SendError::new(code, format!("http {}: {}", status.as_u16(), body))
}

fn map_transport(err: reqwest::Error) -> SendError {
    SendError::new(SendErrorCode::Network, err.to_string())
}

/// Outbound dispatch across WhatsApp, Instagram and Webchat through the
/// Meta Graph API (and an optional webchat delivery endpoint).
pub struct PlatformClient {
    http: reqwest::Client,
    config: PlatformClientConfig,
}

impl PlatformClient {
    pub fn new(config: PlatformClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn messages_url(&self, meta_phone_number_id: &str) -> String {
        format!("{}/{}/messages", self.config.graph_base_url, meta_phone_number_id)
    }

    async fn post_graph(
        &self,
        url: &str,
        access_token: &str,
        payload: &Value,
    ) -> Result<Value, SendError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(map_graph_error(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| SendError::new(SendErrorCode::Network, e.to_string()))
    }

    async fn send_whatsapp(&self, message: &OutboundMessage) -> Result<SendOutcome, SendError> {
        let body = self
            .post_graph(
                &self.messages_url(&message.meta_phone_number_id),
                &message.access_token,
                &whatsapp_payload(message),
            )
            .await?;
        Ok(SendOutcome {
            platform_message_id: body["messages"][0]["id"].as_str().map(String::from),
        })
    }

    async fn send_instagram(&self, message: &OutboundMessage) -> Result<SendOutcome, SendError> {
        let body = self
            .post_graph(
                &self.messages_url(&message.meta_phone_number_id),
                &message.access_token,
                &instagram_payload(message),
            )
            .await?;
        Ok(SendOutcome {
            platform_message_id: body["message_id"].as_str().map(String::from),
        })
    }

    async fn send_webchat(&self, message: &OutboundMessage) -> Result<SendOutcome, SendError> {
        let Some(url) = &self.config.webchat_delivery_url else {
            // No external transport; the live hub already carried the push.
            return Ok(SendOutcome {
                platform_message_id: None,
            });
        };
        let payload = json!({
            "phone_number_id": message.phone_number_id,
            "customer_phone": message.customer_phone,
            "text": truncate_for_platform(&message.text, Platform::Webchat),
        });
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            // Webchat transport errors are always worth a retry.
            return Err(SendError::new(
                SendErrorCode::Network,
                format!("webchat delivery http {}", status.as_u16()),
            ));
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(SendOutcome {
            platform_message_id: body["message_id"].as_str().map(String::from),
        })
    }
}

#[async_trait]
impl MessageSender for PlatformClient {
    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome, SendError> {
        let outcome = match message.platform {
            Platform::Whatsapp => self.send_whatsapp(message).await,
            Platform::Instagram => self.send_instagram(message).await,
            Platform::Webchat => self.send_webchat(message).await,
        };
        match &outcome {
            Ok(result) => debug!(
                platform = %message.platform,
                platform_message_id = result.platform_message_id.as_deref().unwrap_or("-"),
                "message sent"
            ),
            Err(err) => warn!(
                platform = %message.platform,
                code = err.code.as_str(),
                retryable = err.is_retryable(),
                "message send failed"
            ),
        }
        outcome
    }

    async fn send_typing_indicator(&self, indicator: &TypingIndicator) -> Result<(), SendError> {
        let payload = match indicator.platform {
            Platform::Whatsapp => {
                let Some(inbound) = &indicator.inbound_message_id else {
                    return Ok(());
                };
                json!({
                    "messaging_product": "whatsapp",
                    "status": "read",
                    "message_id": inbound,
                    "typing_indicator": { "type": "text" }
                })
            }
            Platform::Instagram => json!({
                "recipient": { "id": indicator.customer_phone },
                "sender_action": "typing_on"
            }),
            // Webchat clients render their own local indicator.
            Platform::Webchat => return Ok(()),
        };
        self.post_graph(
            &self.messages_url(&indicator.meta_phone_number_id),
            &indicator.access_token,
            &payload,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(platform: Platform, text: &str) -> OutboundMessage {
        OutboundMessage {
            phone_number_id: "P1".to_string(),
            customer_phone: "+15550001".to_string(),
            text: text.to_string(),
            platform,
            access_token: "tok".to_string(),
            meta_phone_number_id: "M1".to_string(),
        }
    }

    #[test]
    fn truncation_respects_platform_limits() {
        let long = "x".repeat(5000);
        assert_eq!(
            truncate_for_platform(&long, Platform::Whatsapp).chars().count(),
            4096
        );
        assert_eq!(
            truncate_for_platform(&long, Platform::Instagram).chars().count(),
            1000
        );
        assert_eq!(truncate_for_platform("short", Platform::Whatsapp), "short");
    }

    #[test]
    fn truncation_is_char_safe() {
        let emoji = "🦀".repeat(1100);
        let cut = truncate_for_platform(&emoji, Platform::Instagram);
        assert_eq!(cut.chars().count(), 1000);
    }

    #[test]
    fn whatsapp_payload_shape() {
        let payload = whatsapp_payload(&outbound(Platform::Whatsapp, "Hi!"));
        assert_eq!(payload["messaging_product"], "whatsapp");
        assert_eq!(payload["to"], "+15550001");
        assert_eq!(payload["text"]["body"], "Hi!");
    }

    #[test]
    fn instagram_payload_shape() {
        let payload = instagram_payload(&outbound(Platform::Instagram, "Hi!"));
        assert_eq!(payload["recipient"]["id"], "+15550001");
        assert_eq!(payload["message"]["text"], "Hi!");
    }

    #[test]
    fn graph_error_mapping() {
        let window = map_graph_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"code":131047,"message":"Re-engagement message"}}"#,
        );
        assert_eq!(window.code, SendErrorCode::WindowExpired);
        assert!(!window.is_retryable());

        let unavailable = map_graph_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"code":551}}"#,
        );
        assert_eq!(unavailable.code, SendErrorCode::UserUnavailable);
        assert!(unavailable.is_retryable());

        let rate = map_graph_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "{}");
        assert_eq!(rate.code, SendErrorCode::RateLimit);
        assert!(rate.is_retryable());

        let token = map_graph_error(
            reqwest::StatusCode::UNAUTHORIZED,
            r#"{"error":{"code":190}}"#,
        );
        assert_eq!(token.code, SendErrorCode::InvalidToken);
        assert!(!token.is_retryable());

        let server = map_graph_error(reqwest::StatusCode::BAD_GATEWAY, "upstream");
        assert_eq!(server.code, SendErrorCode::ServerError);
        assert!(server.is_retryable());
    }
}
