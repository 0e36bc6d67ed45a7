use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Originating platform of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Whatsapp,
    Instagram,
    Webchat,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Whatsapp => "whatsapp",
            Platform::Instagram => "instagram",
            Platform::Webchat => "webchat",
        }
    }

    /// Maximum outbound text length accepted by the platform.
    pub fn max_message_len(&self) -> usize {
        match self {
            Platform::Whatsapp => 4096,
            Platform::Instagram => 1000,
            Platform::Webchat => 16_000,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer message accepted from the ingress layer, waiting for a worker.
///
/// Ordering within the queue keyed by `phone_number_id` preserves enqueue
/// order; cross-queue ordering is unspecified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message_id: String,
    pub phone_number_id: String,
    pub customer_phone: String,
    pub message_text: String,
    pub platform_type: Platform,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedMessage {
    pub fn new(
        message_id: impl Into<String>,
        phone_number_id: impl Into<String>,
        customer_phone: impl Into<String>,
        message_text: impl Into<String>,
        platform_type: Platform,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            phone_number_id: phone_number_id.into(),
            customer_phone: customer_phone.into(),
            message_text: message_text.into(),
            platform_type,
            timestamp: now,
            retry_count: 0,
            enqueued_at: now,
            last_error: None,
        }
    }

    /// Required-field validation performed by the worker before processing.
    pub fn validate(&self) -> Result<(), String> {
        if self.message_id.is_empty() {
            return Err("message_id is empty".into());
        }
        if self.phone_number_id.is_empty() {
            return Err("phone_number_id is empty".into());
        }
        if self.customer_phone.is_empty() {
            return Err("customer_phone is empty".into());
        }
        if self.message_text.is_empty() {
            return Err("message_text is empty".into());
        }
        Ok(())
    }
}

/// Time-bounded claim on a dequeued message. Only the holder may complete
/// or fail it; expiry hands the message back to the queue via the janitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLease {
    pub lease_id: String,
    pub message_id: String,
    pub phone_number_id: String,
    pub expires_at: DateTime<Utc>,
}

impl ProcessingLease {
    pub fn new(message_id: &str, phone_number_id: &str, ttl: std::time::Duration) -> Self {
        Self {
            lease_id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            phone_number_id: phone_number_id.to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Exclusive hold on a named resource. Held by value identity: a release
/// carrying a stale `lock_id` must not free a newer holder's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedLock {
    pub lock_id: String,
    pub resource: String,
    pub expires_at: DateTime<Utc>,
}

impl DistributedLock {
    pub fn new(resource: &str, ttl: std::time::Duration) -> Self {
        Self {
            lock_id: Uuid::new_v4().to_string(),
            resource: resource.to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Lock resource key for one customer conversation.
pub fn customer_lock_resource(phone_number_id: &str, customer_phone: &str) -> String {
    format!("customer:{}:{}", phone_number_id, customer_phone)
}

/// A message that exhausted its retries (or failed non-retryably).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessage {
    pub message: QueuedMessage,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Point-in-time queue counters for monitoring and the auto-scaler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
    pub per_queue: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_limits() {
        assert_eq!(Platform::Whatsapp.max_message_len(), 4096);
        assert_eq!(Platform::Whatsapp.as_str(), "whatsapp");
        assert_eq!(Platform::Webchat.to_string(), "webchat");
    }

    #[test]
    fn message_validation() {
        let msg = QueuedMessage::new("m1", "P1", "+15550001", "Hello", Platform::Whatsapp);
        assert!(msg.validate().is_ok());

        let mut bad = msg.clone();
        bad.customer_phone.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn lease_expiry() {
        let lease = ProcessingLease::new("m1", "P1", std::time::Duration::from_secs(300));
        assert!(!lease.is_expired());

        let stale = ProcessingLease::new("m1", "P1", std::time::Duration::from_secs(0));
        assert!(stale.is_expired());
    }

    #[test]
    fn lock_resource_key() {
        assert_eq!(
            customer_lock_resource("P1", "+15550001"),
            "customer:P1:+15550001"
        );
    }
}
