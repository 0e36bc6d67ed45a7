use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::Database;
use crate::storage::GatewayStore;

/// Cached balances go stale after this long.
pub const BALANCE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum CreditError {
    #[error("insufficient credits for user {user_id}: needed {needed}")]
    InsufficientCredits { user_id: String, needed: i64 },
    #[error("credit store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Cached view over the authoritative balance in the persistent store.
/// Decrements are a single conditional update; the cache only ever holds
/// a value the store returned.
pub struct CreditLedger {
    store: Arc<dyn GatewayStore>,
    db: Arc<dyn Database>,
    ttl: Duration,
}

fn balance_key(user_id: &str) -> String {
    format!("credits:{}", user_id)
}

impl CreditLedger {
    pub fn new(store: Arc<dyn GatewayStore>, db: Arc<dyn Database>) -> Self {
        Self {
            store,
            db,
            ttl: BALANCE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cheap pre-flight check against the cached balance. Unknown users
    /// cache a zero so repeated messages don't hammer the store.
    pub async fn has_enough(&self, user_id: &str, amount: i64) -> Result<bool> {
        let key = balance_key(user_id);
        if let Some(raw) = self.store.cache_get(&key).await? {
            if let Ok(balance) = raw.parse::<i64>() {
                return Ok(balance >= amount);
            }
        }

        let balance = match self.db.remaining_credits(user_id).await? {
            Some(balance) => balance,
            None => {
                debug!(user_id, "no credit row, caching zero balance");
                0
            }
        };
        self.store
            .cache_set(&key, &balance.to_string(), Some(self.ttl))
            .await?;
        Ok(balance >= amount)
    }

    /// Atomic conditional decrement against the persistent store. On
    /// success the cache is refreshed with the returned balance rather
    /// than invalidated, so the next check stays a cache hit.
    pub async fn deduct(&self, user_id: &str, amount: i64) -> Result<i64, CreditError> {
        match self.db.deduct_credits(user_id, amount).await? {
            Some(remaining) => {
                self.store
                    .cache_set(&balance_key(user_id), &remaining.to_string(), Some(self.ttl))
                    .await?;
                debug!(user_id, amount, remaining, "credits deducted");
                Ok(remaining)
            }
            None => {
                warn!(user_id, amount, "credit deduction rejected");
                // The authoritative balance said no; make sure the cache
                // does not keep claiming otherwise.
                self.store.cache_del(&balance_key(user_id)).await?;
                Err(CreditError::InsufficientCredits {
                    user_id: user_id.to_string(),
                    needed: amount,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        AgentRoute, CalendarTokens, ConversationRow, Database, MeetingRecord, MessageRecord,
        MessageStatus,
    };
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    struct MockDb {
        balance: AtomicI64,
        reads: AtomicU32,
    }

    impl MockDb {
        fn with_balance(balance: i64) -> Self {
            Self {
                balance: AtomicI64::new(balance),
                reads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Database for MockDb {
        async fn resolve_route(&self, _p: &str) -> Result<Option<AgentRoute>> {
            Ok(None)
        }
        async fn find_active_conversation(
            &self,
            _a: &str,
            _c: &str,
        ) -> Result<Option<ConversationRow>> {
            Ok(None)
        }
        async fn create_conversation(&self, _a: &str, _c: &str) -> Result<ConversationRow> {
            unreachable!()
        }
        async fn set_openai_conversation_id(&self, _c: &str, _o: &str) -> Result<()> {
            Ok(())
        }
        async fn max_sequence_no(&self, _c: &str) -> Result<u64> {
            Ok(0)
        }
        async fn remaining_credits(&self, _user_id: &str) -> Result<Option<i64>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let balance = self.balance.load(Ordering::SeqCst);
            if balance < 0 {
                Ok(None)
            } else {
                Ok(Some(balance))
            }
        }
        async fn deduct_credits(&self, _user_id: &str, amount: i64) -> Result<Option<i64>> {
            let current = self.balance.load(Ordering::SeqCst);
            if current >= amount {
                let remaining = current - amount;
                self.balance.store(remaining, Ordering::SeqCst);
                Ok(Some(remaining))
            } else {
                Ok(None)
            }
        }
        async fn insert_message(&self, _r: &MessageRecord) -> Result<()> {
            Ok(())
        }
        async fn upsert_delivery_status(
            &self,
            _m: &str,
            _p: Option<&str>,
            _s: MessageStatus,
            _e: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
        async fn touch_conversation(&self, _c: &str) -> Result<()> {
            Ok(())
        }
        async fn user_for_conversation(&self, _c: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn calendar_tokens(&self, _u: &str) -> Result<Option<CalendarTokens>> {
            Ok(None)
        }
        async fn store_calendar_tokens(&self, _u: &str, _t: &CalendarTokens) -> Result<()> {
            Ok(())
        }
        async fn insert_meeting(&self, _m: &MeetingRecord) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn balance_check_caches_db_reads() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb::with_balance(100));
        let ledger = CreditLedger::new(store, db.clone());

        assert!(ledger.has_enough("U1", 1).await.unwrap());
        assert!(ledger.has_enough("U1", 1).await.unwrap());
        assert!(ledger.has_enough("U1", 1).await.unwrap());
        assert_eq!(db.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_user_caches_zero() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb::with_balance(-1));
        let ledger = CreditLedger::new(store, db.clone());

        assert!(!ledger.has_enough("ghost", 1).await.unwrap());
        assert!(!ledger.has_enough("ghost", 1).await.unwrap());
        assert_eq!(db.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deduct_refreshes_cache_with_new_balance() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb::with_balance(2));
        let ledger = CreditLedger::new(store, db.clone());

        assert_eq!(ledger.deduct("U1", 1).await.unwrap(), 1);
        // Cached balance reflects the deduction without another DB read.
        assert!(ledger.has_enough("U1", 1).await.unwrap());
        assert!(!ledger.has_enough("U1", 2).await.unwrap());
        assert_eq!(db.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deduct_rejection_leaves_balance_unchanged() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb::with_balance(1));
        let ledger = CreditLedger::new(store, db.clone());

        let err = ledger.deduct("U1", 5).await.unwrap_err();
        assert!(matches!(err, CreditError::InsufficientCredits { .. }));
        assert_eq!(db.balance.load(Ordering::SeqCst), 1);
    }
}
