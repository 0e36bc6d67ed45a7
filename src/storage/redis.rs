use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient, Script};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
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

/// Configuration for the Redis-backed store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub lease_ttl: Duration,
    pub dedup_ttl: Duration,
    pub janitor_interval: Duration,
    pub max_retries: u32,
    pub max_failed_messages: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "chatgate".to_string(),
            lease_ttl: DEFAULT_LEASE_TTL,
            dedup_ttl: Duration::from_secs(5),
            janitor_interval: JANITOR_INTERVAL,
            max_retries: MAX_MESSAGE_RETRIES,
            max_failed_messages: MAX_FAILED_MESSAGES,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct InFlightRecord {
    lease: ProcessingLease,
    message: QueuedMessage,
}

/// External-KV [`GatewayStore`] backend. Queue, lease, lock, cache and
/// dedup state live in Redis so they survive process restarts; the
/// message-available signal stays in-process.
pub struct RedisStore {
    config: RedisStoreConfig,
    conn: ConnectionManager,
    events: broadcast::Sender<String>,
    janitor_stop: AtomicBool,
}

impl RedisStore {
    pub async fn connect(config: RedisStoreConfig) -> Result<Arc<Self>> {
        let client = RedisClient::open(config.redis_url.clone())
            .with_context(|| format!("invalid redis url: {}", config.redis_url))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to establish redis connection")?;

        let (events, _) = broadcast::channel(1024);
        let store = Arc::new(Self {
            config,
            conn,
            events,
            janitor_stop: AtomicBool::new(false),
        });

        // Round-trip once so a bad deployment fails at startup, not mid-message.
        let mut probe = store.conn.clone();
        let _: () = probe
            .set(store.key("probe"), "ping")
            .await
            .context("redis connection probe failed")?;
        let _: () = probe.del(store.key("probe")).await?;
        info!(prefix = %store.config.key_prefix, "redis store connected");
        Ok(store)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.config.key_prefix, suffix)
    }

    fn queue_key(&self, phone: &str) -> String {
        self.key(&format!("queue:{}", phone))
    }

    fn cache_key(&self, key: &str) -> String {
        self.key(&format!("cache:{}", key))
    }

    fn set_key(&self, key: &str) -> String {
        self.key(&format!("set:{}", key))
    }

    fn lock_key(&self, resource: &str) -> String {
        self.key(&format!("lock:{}", resource))
    }

    pub fn start_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(store.config.janitor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if store.janitor_stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = store.sweep_expired().await {
                    warn!(error = %e, "redis janitor sweep failed");
                }
            }
        })
    }

    pub fn stop_janitor(&self) {
        self.janitor_stop.store(true, Ordering::Relaxed);
    }

    /// Re-enqueue messages whose lease expiry score passed. Cache, lock and
    /// dedup keys expire natively via PX and need no sweeping here.
    pub async fn sweep_expired(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = conn
            .zrangebyscore(self.key("processing_exp"), i64::MIN, now)
            .await?;

        for lease_id in expired {
            let raw: Option<String> = conn.hget(self.key("processing"), &lease_id).await?;
            let _: () = conn.zrem(self.key("processing_exp"), &lease_id).await?;
            let _: () = conn.hdel(self.key("processing"), &lease_id).await?;

            let Some(raw) = raw else { continue };
            let record: InFlightRecord = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!(lease_id = %lease_id, error = %e, "dropping undecodable in-flight record");
                    continue;
                }
            };
            let mut message = record.message;
            message.retry_count += 1;
            message.last_error = Some("lease expired".to_string());

            if message.retry_count > self.config.max_retries {
                warn!(message_id = %message.message_id, "lease expired past retry budget");
                self.push_failed(&mut conn, message, "lease expired").await?;
            } else {
                warn!(
                    message_id = %message.message_id,
                    retry_count = message.retry_count,
                    "lease expired, re-enqueuing"
                );
                let phone = message.phone_number_id.clone();
                let payload = serde_json::to_string(&message)?;
                let _: () = conn.lpush(self.queue_key(&phone), payload).await?;
                let _: () = conn.lpush(self.key("arrival"), &phone).await?;
                let _ = self.events.send(phone);
            }
        }
        Ok(())
    }

    async fn push_failed(
        &self,
        conn: &mut ConnectionManager,
        message: QueuedMessage,
        error: &str,
    ) -> Result<()> {
        let entry = FailedMessage {
            message,
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_string(&entry)?;
        let _: () = conn.lpush(self.key("failed"), payload).await?;
        let _: () = conn
            .ltrim(
                self.key("failed"),
                0,
                self.config.max_failed_messages as isize - 1,
            )
            .await?;
        let _: i64 = conn.incr(self.key("failed_total"), 1).await?;
        Ok(())
    }

    async fn claim(
        &self,
        conn: &mut ConnectionManager,
        phone: &str,
    ) -> Result<Option<(QueuedMessage, ProcessingLease)>> {
        let raw: Option<String> = conn.lpop(self.queue_key(phone), None).await?;
        let Some(raw) = raw else { return Ok(None) };
        let message: QueuedMessage =
            serde_json::from_str(&raw).context("undecodable queued message")?;

        let lease = ProcessingLease::new(&message.message_id, phone, self.config.lease_ttl);
        let record = InFlightRecord {
            lease: lease.clone(),
            message: message.clone(),
        };
        let _: () = conn
            .hset(
                self.key("processing"),
                &lease.lease_id,
                serde_json::to_string(&record)?,
            )
            .await?;
        let _: () = conn
            .zadd(
                self.key("processing_exp"),
                &lease.lease_id,
                lease.expires_at.timestamp_millis(),
            )
            .await?;
        Ok(Some((message, lease)))
    }

    async fn remove_in_flight(
        &self,
        conn: &mut ConnectionManager,
        lease_id: &str,
    ) -> Result<Option<InFlightRecord>> {
        let raw: Option<String> = conn.hget(self.key("processing"), lease_id).await?;
        let _: () = conn.hdel(self.key("processing"), lease_id).await?;
        let _: () = conn.zrem(self.key("processing_exp"), lease_id).await?;
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).context("undecodable in-flight record")?,
            )),
            None => Ok(None),
        }
    }
}

// Compare-and-delete / compare-and-expire so a stale holder can never
// touch a newer holder's lock.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('pexpire', KEYS[1], ARGV[2])
else
  return 0
end
"#;

#[async_trait]
impl GatewayStore for RedisStore {
    async fn enqueue(&self, message: QueuedMessage) -> Result<bool> {
        if self
            .is_duplicate(&message.phone_number_id, &message.message_text)
            .await?
        {
            info!(message_id = %message.message_id, "dedup window hit, dropping message");
            return Ok(false);
        }
        self.mark_processed(
            &message.phone_number_id,
            &message.message_text,
            self.config.dedup_ttl,
        )
        .await?;

        let mut conn = self.conn.clone();
        let phone = message.phone_number_id.clone();
        let payload = serde_json::to_string(&message)?;
        let _: () = conn.rpush(self.queue_key(&phone), payload).await?;
        let _: () = conn.rpush(self.key("arrival"), &phone).await?;
        let _: () = conn.sadd(self.key("phones"), &phone).await?;
        debug!(phone_number_id = %phone, "message enqueued");
        let _ = self.events.send(phone);
        Ok(true)
    }

    async fn dequeue(
        &self,
        phone: Option<&str>,
    ) -> Result<Option<(QueuedMessage, ProcessingLease)>> {
        let mut conn = self.conn.clone();

        if let Some(phone) = phone {
            let claimed = self.claim(&mut conn, phone).await?;
            if claimed.is_some() {
                let _: i64 = conn.lrem(self.key("arrival"), 1, phone).await?;
            }
            return Ok(claimed);
        }

        // Walk arrival order; a raced-away head just advances the scan.
        loop {
            let candidate: Option<String> = conn.lpop(self.key("arrival"), None).await?;
            let Some(candidate) = candidate else {
                return Ok(None);
            };
            if let Some(claimed) = self.claim(&mut conn, &candidate).await? {
                return Ok(Some(claimed));
            }
        }
    }

    async fn complete(&self, lease: &ProcessingLease) -> Result<()> {
        let mut conn = self.conn.clone();
        if self
            .remove_in_flight(&mut conn, &lease.lease_id)
            .await?
            .is_some()
        {
            let _: i64 = conn.incr(self.key("completed"), 1).await?;
        } else {
            warn!(lease_id = %lease.lease_id, "complete on unknown or expired lease");
        }
        Ok(())
    }

    async fn fail(&self, lease: &ProcessingLease, error: &str, retryable: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let Some(record) = self.remove_in_flight(&mut conn, &lease.lease_id).await? else {
            warn!(lease_id = %lease.lease_id, "fail on unknown or expired lease");
            return Ok(());
        };
        let mut message = record.message;
        message.retry_count += 1;
        message.last_error = Some(error.to_string());

        if retryable && message.retry_count < self.config.max_retries {
            let phone = message.phone_number_id.clone();
            let payload = serde_json::to_string(&message)?;
            let _: () = conn.lpush(self.queue_key(&phone), payload).await?;
            let _: () = conn.lpush(self.key("arrival"), &phone).await?;
            let _ = self.events.send(phone);
        } else {
            self.push_failed(&mut conn, message, error).await?;
        }
        Ok(())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let phones: Vec<String> = conn.smembers(self.key("phones")).await?;
        let mut per_queue = HashMap::new();
        let mut queued = 0u64;
        for phone in phones {
            let depth: u64 = conn.llen(self.queue_key(&phone)).await?;
            if depth > 0 {
                queued += depth;
                per_queue.insert(phone, depth);
            }
        }
        let processing: u64 = conn.hlen(self.key("processing")).await?;
        let completed: Option<u64> = conn.get(self.key("completed")).await?;
        let failed_total: Option<u64> = conn.get(self.key("failed_total")).await?;
        let dead_letter: u64 = conn.llen(self.key("failed")).await?;
        Ok(QueueStats {
            queued,
            processing,
            completed: completed.unwrap_or(0),
            failed: failed_total.unwrap_or(0),
            dead_letter,
            per_queue,
        })
    }

    async fn failed_messages(&self) -> Result<Vec<FailedMessage>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(self.key("failed"), 0, -1).await?;
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(parsed) => out.push(parsed),
                Err(e) => warn!(error = %e, "skipping undecodable failed message"),
            }
        }
        Ok(out)
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(self.cache_key(key)).await?)
    }

    async fn cache_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = redis::cmd("SET")
                    .arg(self.cache_key(key))
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?;
            }
            None => {
                let _: () = conn.set(self.cache_key(key), value).await?;
            }
        }
        Ok(())
    }

    async fn cache_del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.cache_key(key)).await?;
        Ok(())
    }

    async fn cache_exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.cache_key(key)).await?)
    }

    async fn cache_expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(self.cache_key(key))
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn cache_incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(self.cache_key(key), by).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(self.set_key(key), member).await?;
        Ok(added == 1)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(self.set_key(key), member).await?;
        Ok(removed == 1)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(self.set_key(key)).await?)
    }

    async fn set_card(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.set_key(key)).await?)
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
        max_retries: u32,
    ) -> Result<Option<DistributedLock>> {
        let mut conn = self.conn.clone();
        let key = self.lock_key(resource);
        for attempt in 0..=max_retries {
            let lock = DistributedLock::new(resource, ttl);
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&lock.lock_id)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
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
        let mut conn = self.conn.clone();
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(&lock.resource))
            .arg(&lock.lock_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn extend_lock(&self, lock: &DistributedLock, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(self.lock_key(&lock.resource))
            .arg(&lock.lock_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
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
