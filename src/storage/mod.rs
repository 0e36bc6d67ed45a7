pub mod dedup;
pub mod memory;
pub mod redis;
pub mod types;

pub use memory::MemoryStore;
pub use types::{
    customer_lock_resource, DistributedLock, FailedMessage, Platform, ProcessingLease,
    QueueStats, QueuedMessage,
};

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long a dequeued message stays claimed before the janitor hands it back.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);
/// Sleep between lock acquisition attempts.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Janitor sweep cadence for expired cache entries, locks and leases.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
/// Re-enqueue a failed message at most this many times.
pub const MAX_MESSAGE_RETRIES: u32 = 3;
/// Bound on the failed-messages map.
pub const MAX_FAILED_MESSAGES: usize = 1000;

/// The single shared-state surface of the pipeline: per-phone FIFO queues
/// with leases, a TTL cache, sets, exclusive locks and the dedup window.
///
/// Backends may be in-process ([`MemoryStore`]) or an external KV
/// ([`redis::RedisStore`]); the contracts are identical either way.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    // -- queue ----------------------------------------------------------

    /// Append to the tail of the per-`phone_number_id` queue and signal
    /// message-available. Returns `false` when the dedup window suppressed
    /// the message.
    async fn enqueue(&self, message: QueuedMessage) -> Result<bool>;

    /// Atomically remove a queue head and claim it with a lease. `phone`
    /// restricts the scan to one queue. `None` when nothing is ready.
    async fn dequeue(
        &self,
        phone: Option<&str>,
    ) -> Result<Option<(QueuedMessage, ProcessingLease)>>;

    /// Drop the leased message for good; the pipeline is done with it.
    async fn complete(&self, lease: &ProcessingLease) -> Result<()>;

    /// Release the lease with an error. Retryable failures re-enqueue until
    /// the retry budget runs out; non-retryable ones go straight to the
    /// failed-messages map.
    async fn fail(&self, lease: &ProcessingLease, error: &str, retryable: bool) -> Result<()>;

    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Bounded map of messages that exhausted their retries.
    async fn failed_messages(&self) -> Result<Vec<FailedMessage>>;

    // -- cache ----------------------------------------------------------

    async fn cache_get(&self, key: &str) -> Result<Option<String>>;
    async fn cache_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn cache_del(&self, key: &str) -> Result<()>;
    async fn cache_exists(&self, key: &str) -> Result<bool>;
    async fn cache_expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    /// Atomic counter increment; missing keys start at zero.
    async fn cache_incr(&self, key: &str, by: i64) -> Result<i64>;

    // -- sets -----------------------------------------------------------

    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
    async fn set_card(&self, key: &str) -> Result<u64>;

    // -- locks ----------------------------------------------------------

    /// Bounded acquisition: retry every [`LOCK_RETRY_DELAY`] up to
    /// `max_retries` times, then give up with `None`.
    async fn acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
        max_retries: u32,
    ) -> Result<Option<DistributedLock>>;

    /// No-op (returning `false`) when the current holder's `lock_id`
    /// differs from `lock`: a late release must not free a newer holder.
    async fn release_lock(&self, lock: &DistributedLock) -> Result<bool>;

    async fn extend_lock(&self, lock: &DistributedLock, ttl: Duration) -> Result<bool>;

    // -- dedup ----------------------------------------------------------

    async fn is_duplicate(&self, phone_number_id: &str, content: &str) -> Result<bool>;
    async fn mark_processed(
        &self,
        phone_number_id: &str,
        content: &str,
        ttl: Duration,
    ) -> Result<()>;

    // -- dispatch -------------------------------------------------------

    /// Subscribe to message-available events. Each event carries the
    /// `phone_number_id` whose queue grew; used for zero-polling dispatch.
    fn message_events(&self) -> broadcast::Receiver<String>;
}
