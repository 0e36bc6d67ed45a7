use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::dedup::{content_fingerprint, dedup_key};
use super::types::{
    DistributedLock, FailedMessage, ProcessingLease, QueueStats, QueuedMessage,
};
use super::{
    GatewayStore, DEFAULT_LEASE_TTL, JANITOR_INTERVAL, LOCK_RETRY_DELAY, MAX_FAILED_MESSAGES,
    MAX_MESSAGE_RETRIES,
};

/// Tunables for the in-process backend.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    pub lease_ttl: Duration,
    pub dedup_ttl: Duration,
    pub janitor_interval: Duration,
    pub max_retries: u32,
    pub max_failed_messages: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            dedup_ttl: Duration::from_secs(5),
            janitor_interval: JANITOR_INTERVAL,
            max_retries: MAX_MESSAGE_RETRIES,
            max_failed_messages: MAX_FAILED_MESSAGES,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if t <= Utc::now())
    }
}

struct InFlight {
    lease: ProcessingLease,
    message: QueuedMessage,
}

#[derive(Default)]
struct QueueState {
    /// Tail-append FIFO per phone_number_id.
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    /// Arrival order of phone ids; one entry per enqueued message.
    arrival: VecDeque<String>,
    /// Lease id -> claimed message.
    processing: HashMap<String, InFlight>,
    /// Bounded dead-letter map, oldest dropped first.
    failed: VecDeque<FailedMessage>,
    completed: u64,
    failed_total: u64,
}

impl QueueState {
    fn remove_arrival(&mut self, phone: &str) {
        if let Some(pos) = self.arrival.iter().position(|p| p == phone) {
            self.arrival.remove(pos);
        }
    }

    fn push_failed(&mut self, entry: FailedMessage, cap: usize) {
        if self.failed.len() >= cap {
            self.failed.pop_front();
        }
        self.failed.push_back(entry);
        self.failed_total += 1;
    }
}

/// In-process [`GatewayStore`] backend. All mutation funnels through the
/// interior locks; the janitor task sweeps TTL-bearing state.
pub struct MemoryStore {
    config: MemoryStoreConfig,
    queue: Mutex<QueueState>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
    locks: Mutex<HashMap<String, DistributedLock>>,
    events: broadcast::Sender<String>,
    janitor_stop: AtomicBool,
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            queue: Mutex::new(QueueState::default()),
            cache: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            events,
            janitor_stop: AtomicBool::new(false),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(MemoryStoreConfig::default())
    }

    /// Spawn the background sweeper for cache entries, locks and leases.
    pub fn start_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(store.config.janitor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if store.janitor_stop.load(Ordering::Relaxed) {
                    debug!("janitor stopping");
                    break;
                }
                store.sweep_expired().await;
            }
        })
    }

    pub fn stop_janitor(&self) {
        self.janitor_stop.store(true, Ordering::Relaxed);
    }

    /// One janitor pass: lazily-expired cache keys, stale locks, dead leases.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();

        let removed_cache = {
            let mut cache = self.cache.write().await;
            let before = cache.len();
            cache.retain(|_, entry| !entry.is_expired());
            before - cache.len()
        };

        let removed_locks = {
            let mut locks = self.locks.lock().await;
            let before = locks.len();
            locks.retain(|_, lock| lock.expires_at > now);
            before - locks.len()
        };

        // Expired leases hand the message back to the front of its queue so
        // per-conversation order survives a worker crash.
        let mut reenqueued: Vec<String> = Vec::new();
        {
            let mut state = self.queue.lock().await;
            let expired: Vec<String> = state
                .processing
                .iter()
                .filter(|(_, inflight)| inflight.lease.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();

            for lease_id in expired {
                let Some(inflight) = state.processing.remove(&lease_id) else {
                    continue;
                };
                let mut message = inflight.message;
                message.retry_count += 1;
                message.last_error = Some("lease expired".to_string());
                if message.retry_count > self.config.max_retries {
                    warn!(
                        message_id = %message.message_id,
                        retry_count = message.retry_count,
                        "lease expired past retry budget, moving to failed messages"
                    );
                    let cap = self.config.max_failed_messages;
                    state.push_failed(
                        FailedMessage {
                            message,
                            error: "lease expired".to_string(),
                            failed_at: now,
                        },
                        cap,
                    );
                } else {
                    let phone = message.phone_number_id.clone();
                    warn!(
                        message_id = %message.message_id,
                        phone_number_id = %phone,
                        retry_count = message.retry_count,
                        "lease expired, re-enqueuing message"
                    );
                    state
                        .queues
                        .entry(phone.clone())
                        .or_default()
                        .push_front(message);
                    state.arrival.push_front(phone.clone());
                    reenqueued.push(phone);
                }
            }
        }

        for phone in reenqueued {
            let _ = self.events.send(phone);
        }

        if removed_cache > 0 || removed_locks > 0 {
            debug!(
                cache_expired = removed_cache,
                locks_expired = removed_locks,
                "janitor sweep complete"
            );
        }
    }

    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Option<DistributedLock> {
        let mut locks = self.locks.lock().await;
        match locks.get(resource) {
            Some(existing) if !existing.is_expired() => None,
            _ => {
                let lock = DistributedLock::new(resource, ttl);
                locks.insert(resource.to_string(), lock.clone());
                Some(lock)
            }
        }
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn enqueue(&self, message: QueuedMessage) -> Result<bool> {
        if self
            .is_duplicate(&message.phone_number_id, &message.message_text)
            .await?
        {
            info!(
                message_id = %message.message_id,
                phone_number_id = %message.phone_number_id,
                "dedup window hit, dropping message"
            );
            return Ok(false);
        }
        self.mark_processed(
            &message.phone_number_id,
            &message.message_text,
            self.config.dedup_ttl,
        )
        .await?;

        let phone = message.phone_number_id.clone();
        let depth = {
            let mut state = self.queue.lock().await;
            let queue = state.queues.entry(phone.clone()).or_default();
            queue.push_back(message);
            let depth = queue.len();
            state.arrival.push_back(phone.clone());
            depth
        };
        debug!(phone_number_id = %phone, queue_depth = depth, "message enqueued");
        let _ = self.events.send(phone);
        Ok(true)
    }

    async fn dequeue(
        &self,
        phone: Option<&str>,
    ) -> Result<Option<(QueuedMessage, ProcessingLease)>> {
        let mut state = self.queue.lock().await;

        let phone = match phone {
            Some(p) => {
                if state.queues.get(p).map_or(true, |q| q.is_empty()) {
                    return Ok(None);
                }
                p.to_string()
            }
            None => {
                // Oldest arrival whose queue still has a head.
                let mut found = None;
                while let Some(candidate) = state.arrival.front().cloned() {
                    if state
                        .queues
                        .get(&candidate)
                        .map_or(false, |q| !q.is_empty())
                    {
                        found = Some(candidate);
                        break;
                    }
                    state.arrival.pop_front();
                }
                match found {
                    Some(p) => p,
                    None => return Ok(None),
                }
            }
        };

        state.remove_arrival(&phone);
        let message = match state.queues.get_mut(&phone).and_then(|q| q.pop_front()) {
            Some(m) => m,
            None => return Ok(None),
        };

        let lease = ProcessingLease::new(&message.message_id, &phone, self.config.lease_ttl);
        state.processing.insert(
            lease.lease_id.clone(),
            InFlight {
                lease: lease.clone(),
                message: message.clone(),
            },
        );
        debug!(
            message_id = %message.message_id,
            lease_id = %lease.lease_id,
            "message dequeued with lease"
        );
        Ok(Some((message, lease)))
    }

    async fn complete(&self, lease: &ProcessingLease) -> Result<()> {
        let mut state = self.queue.lock().await;
        if state.processing.remove(&lease.lease_id).is_some() {
            state.completed += 1;
            debug!(lease_id = %lease.lease_id, "lease completed");
        } else {
            warn!(lease_id = %lease.lease_id, "complete on unknown or expired lease");
        }
        Ok(())
    }

    async fn fail(&self, lease: &ProcessingLease, error: &str, retryable: bool) -> Result<()> {
        let notify_phone = {
            let mut state = self.queue.lock().await;
            let Some(inflight) = state.processing.remove(&lease.lease_id) else {
                warn!(lease_id = %lease.lease_id, "fail on unknown or expired lease");
                return Ok(());
            };
            let mut message = inflight.message;
            message.retry_count += 1;
            message.last_error = Some(error.to_string());

            if retryable && message.retry_count < self.config.max_retries {
                let phone = message.phone_number_id.clone();
                info!(
                    message_id = %message.message_id,
                    retry_count = message.retry_count,
                    error,
                    "message failed, re-enqueuing"
                );
                state
                    .queues
                    .entry(phone.clone())
                    .or_default()
                    .push_front(message);
                state.arrival.push_front(phone.clone());
                Some(phone)
            } else {
                warn!(
                    message_id = %message.message_id,
                    retry_count = message.retry_count,
                    error,
                    "message moved to failed messages"
                );
                let cap = self.config.max_failed_messages;
                state.push_failed(
                    FailedMessage {
                        message,
                        error: error.to_string(),
                        failed_at: Utc::now(),
                    },
                    cap,
                );
                None
            }
        };
        if let Some(phone) = notify_phone {
            let _ = self.events.send(phone);
        }
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let state = self.queue.lock().await;
        let per_queue: HashMap<String, u64> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(k, q)| (k.clone(), q.len() as u64))
            .collect();
        Ok(QueueStats {
            queued: per_queue.values().sum(),
            processing: state.processing.len() as u64,
            completed: state.completed,
            failed: state.failed_total,
            dead_letter: state.failed.len() as u64,
            per_queue,
        })
    }

    async fn failed_messages(&self) -> Result<Vec<FailedMessage>> {
        let state = self.queue.lock().await;
        Ok(state.failed.iter().cloned().collect())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        {
            let cache = self.cache.read().await;
            match cache.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }
        // Lazy expiry on read.
        let mut cache = self.cache.write().await;
        if cache.get(key).map_or(false, |e| e.is_expired()) {
            cache.remove(key);
        }
        Ok(cache.get(key).map(|e| e.value.clone()))
    }

    async fn cache_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at =
            ttl.map(|t| Utc::now() + chrono::Duration::from_std(t).unwrap_or_default());
        self.cache.write().await.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn cache_del(&self, key: &str) -> Result<()> {
        self.cache.write().await.remove(key);
        Ok(())
    }

    async fn cache_exists(&self, key: &str) -> Result<bool> {
        Ok(self.cache_get(key).await?.is_some())
    }

    async fn cache_expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut cache = self.cache.write().await;
        match cache.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at =
                    Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cache_incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut cache = self.cache.write().await;
        let current = match cache.get(key) {
            Some(entry) if !entry.is_expired() => entry.value.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + by;
        let expires_at = cache.get(key).and_then(|e| e.expires_at);
        cache.insert(
            key.to_string(),
            CacheEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut sets = self.sets.write().await;
        Ok(sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut sets = self.sets.write().await;
        let removed = sets.get_mut(key).map_or(false, |s| s.remove(member));
        if sets.get(key).map_or(false, |s| s.is_empty()) {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let sets = self.sets.read().await;
        Ok(sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_card(&self, key: &str) -> Result<u64> {
        let sets = self.sets.read().await;
        Ok(sets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
        max_retries: u32,
    ) -> Result<Option<DistributedLock>> {
        for attempt in 0..=max_retries {
            if let Some(lock) = self.try_acquire(resource, ttl).await {
                if attempt > 0 {
                    debug!(resource, attempt, "lock acquired after contention");
                }
                return Ok(Some(lock));
            }
            if attempt < max_retries {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
        }
        warn!(resource, max_retries, "lock acquisition exhausted retries");
        Ok(None)
    }

    async fn release_lock(&self, lock: &DistributedLock) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(&lock.resource) {
            Some(current) if current.lock_id == lock.lock_id => {
                locks.remove(&lock.resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lock(&self, lock: &DistributedLock, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(&lock.resource) {
            Some(current) if current.lock_id == lock.lock_id && !current.is_expired() => {
                current.expires_at =
                    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_duplicate(&self, phone_number_id: &str, content: &str) -> Result<bool> {
        let key = dedup_key(&content_fingerprint(phone_number_id, content));
        self.cache_exists(&key).await
    }

    async fn mark_processed(
        &self,
        phone_number_id: &str,
        content: &str,
        ttl: Duration,
    ) -> Result<()> {
        let key = dedup_key(&content_fingerprint(phone_number_id, content));
        self.cache_set(&key, "1", Some(ttl)).await
    }

    fn message_events(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Platform;

    fn msg(id: &str, phone: &str, text: &str) -> QueuedMessage {
        QueuedMessage::new(id, phone, "+15550001", text, Platform::Whatsapp)
    }

    fn store() -> Arc<MemoryStore> {
        MemoryStore::new(MemoryStoreConfig {
            dedup_ttl: Duration::from_millis(50),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn fifo_order_per_phone() {
        let store = store();
        store.enqueue(msg("m1", "P1", "first")).await.unwrap();
        store.enqueue(msg("m2", "P1", "second")).await.unwrap();

        let (first, lease1) = store.dequeue(Some("P1")).await.unwrap().unwrap();
        assert_eq!(first.message_id, "m1");
        store.complete(&lease1).await.unwrap();

        let (second, _) = store.dequeue(Some("P1")).await.unwrap().unwrap();
        assert_eq!(second.message_id, "m2");
    }

    #[tokio::test]
    async fn dequeue_round_trip_preserves_fields() {
        let store = store();
        let original = msg("m1", "P1", "Hello");
        store.enqueue(original.clone()).await.unwrap();

        let (out, lease) = store.dequeue(None).await.unwrap().unwrap();
        assert_eq!(out.message_id, original.message_id);
        assert_eq!(out.message_text, original.message_text);
        assert_eq!(out.customer_phone, original.customer_phone);
        assert_eq!(out.retry_count, 0);
        store.complete(&lease).await.unwrap();
        assert!(store.dequeue(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedup_window_suppresses_identical_content() {
        let store = store();
        assert!(store.enqueue(msg("m1", "P1", "Hello")).await.unwrap());
        assert!(!store.enqueue(msg("m2", "P1", "Hello")).await.unwrap());
        // Different phone id is not a duplicate.
        assert!(store.enqueue(msg("m3", "P2", "Hello")).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.enqueue(msg("m4", "P1", "Hello")).await.unwrap());
    }

    #[tokio::test]
    async fn fail_retryable_reenqueues_until_budget() {
        let store = store();
        store.enqueue(msg("m1", "P1", "Hello")).await.unwrap();

        for expected_retry in 1..MAX_MESSAGE_RETRIES {
            let (message, lease) = store.dequeue(None).await.unwrap().unwrap();
            assert_eq!(message.retry_count, expected_retry - 1);
            store.fail(&lease, "boom", true).await.unwrap();
        }

        // Third failure exhausts the budget.
        let (_, lease) = store.dequeue(None).await.unwrap().unwrap();
        store.fail(&lease, "boom", true).await.unwrap();

        assert!(store.dequeue(None).await.unwrap().is_none());
        let failed = store.failed_messages().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message.message_id, "m1");
        assert_eq!(failed[0].error, "boom");
    }

    #[tokio::test]
    async fn fail_non_retryable_dead_letters_immediately() {
        let store = store();
        store.enqueue(msg("m1", "P1", "Hello")).await.unwrap();
        let (_, lease) = store.dequeue(None).await.unwrap().unwrap();
        store.fail(&lease, "invalid payload", false).await.unwrap();

        assert!(store.dequeue(None).await.unwrap().is_none());
        assert_eq!(store.failed_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reenqueued_by_sweep() {
        let store = MemoryStore::new(MemoryStoreConfig {
            lease_ttl: Duration::from_millis(0),
            dedup_ttl: Duration::from_millis(10),
            ..Default::default()
        });
        store.enqueue(msg("m1", "P1", "Hello")).await.unwrap();
        let (_, _lease) = store.dequeue(None).await.unwrap().unwrap();

        store.sweep_expired().await;

        let (recovered, _) = store.dequeue(None).await.unwrap().unwrap();
        assert_eq!(recovered.message_id, "m1");
        assert_eq!(recovered.retry_count, 1);
        assert_eq!(recovered.last_error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_released_by_identity() {
        let store = store();
        let ttl = Duration::from_secs(30);

        let lock = store
            .acquire_lock("customer:P1:+1", ttl, 0)
            .await
            .unwrap()
            .expect("first acquire");
        assert!(store
            .acquire_lock("customer:P1:+1", ttl, 0)
            .await
            .unwrap()
            .is_none());

        // A stale handle must not free the current holder.
        let stale = DistributedLock::new("customer:P1:+1", ttl);
        assert!(!store.release_lock(&stale).await.unwrap());
        assert!(store
            .acquire_lock("customer:P1:+1", ttl, 0)
            .await
            .unwrap()
            .is_none());

        assert!(store.release_lock(&lock).await.unwrap());
        assert!(store
            .acquire_lock("customer:P1:+1", ttl, 0)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn lock_expiry_allows_takeover() {
        let store = store();
        let _stalled = store
            .acquire_lock("r", Duration::from_millis(0), 0)
            .await
            .unwrap()
            .unwrap();
        let taken = store
            .acquire_lock("r", Duration::from_secs(10), 0)
            .await
            .unwrap();
        assert!(taken.is_some());
    }

    #[tokio::test]
    async fn extend_lock_requires_current_holder() {
        let store = store();
        let lock = store
            .acquire_lock("r", Duration::from_secs(10), 0)
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .extend_lock(&lock, Duration::from_secs(60))
            .await
            .unwrap());

        let stale = DistributedLock::new("r", Duration::from_secs(10));
        assert!(!store
            .extend_lock(&stale, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cache_ttl_and_incr() {
        let store = store();
        store
            .cache_set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(store.cache_get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.cache_get("k").await.unwrap().is_none());

        assert_eq!(store.cache_incr("n", 1).await.unwrap(), 1);
        assert_eq!(store.cache_incr("n", 1).await.unwrap(), 2);
        assert_eq!(store.cache_incr("n", 5).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn set_operations() {
        let store = store();
        assert!(store.set_add("s", "a").await.unwrap());
        assert!(!store.set_add("s", "a").await.unwrap());
        assert!(store.set_add("s", "b").await.unwrap());
        assert_eq!(store.set_card("s").await.unwrap(), 2);
        assert!(store.set_remove("s", "a").await.unwrap());
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn enqueue_signals_message_event() {
        let store = store();
        let mut events = store.message_events();
        store.enqueue(msg("m1", "P1", "Hello")).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), "P1");
    }

    #[tokio::test]
    async fn queue_stats_reflect_lifecycle() {
        let store = store();
        store.enqueue(msg("m1", "P1", "one")).await.unwrap();
        store.enqueue(msg("m2", "P2", "two")).await.unwrap();

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.processing, 0);

        let (_, lease) = store.dequeue(None).await.unwrap().unwrap();
        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processing, 1);

        store.complete(&lease).await.unwrap();
        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.completed, 1);
    }
}
