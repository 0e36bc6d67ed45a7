use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::storage::{GatewayStore, Platform};

/// Cached session snapshots live this long before the next DB round-trip.
pub const SESSION_TTL: Duration = Duration::from_secs(300);

/// Everything a worker needs to service one message, resolved once and
/// cached. Carries ids and credentials only; row objects stay in the DB
/// layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub agent_id: String,
    pub prompt_id: String,
    pub conversation_id: String,
    pub openai_conversation_id: Option<String>,
    pub access_token: String,
    pub meta_phone_number_id: String,
    pub platform: Platform,
}

/// Maps `(phone_number_id, customer_phone)` to a [`Session`], with
/// write-through persistence for the conversation row it materializes.
pub struct SessionCache {
    store: Arc<dyn GatewayStore>,
    db: Arc<dyn Database>,
    ttl: Duration,
}

fn session_key(phone_number_id: &str, customer_phone: &str) -> String {
    format!("session:{}:{}", phone_number_id, customer_phone)
}

fn sequence_key(conversation_id: &str) -> String {
    format!("seq:{}", conversation_id)
}

impl SessionCache {
    pub fn new(store: Arc<dyn GatewayStore>, db: Arc<dyn Database>) -> Self {
        Self {
            store,
            db,
            ttl: SESSION_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolve the session for a customer message. `None` means no agent is
    /// mapped to the phone number; the caller orphans the message.
    ///
    /// A cache miss queries phone_numbers → agents → users and the active
    /// conversation for the pair, creating the conversation lazily.
    pub async fn get_or_create(
        &self,
        phone_number_id: &str,
        customer_phone: &str,
    ) -> Result<Option<Session>> {
        let key = session_key(phone_number_id, customer_phone);
        if let Some(raw) = self.store.cache_get(&key).await? {
            match serde_json::from_str::<Session>(&raw) {
                Ok(session) => return Ok(Some(session)),
                Err(e) => {
                    warn!(key = %key, error = %e, "evicting undecodable cached session");
                    self.store.cache_del(&key).await?;
                }
            }
        }

        let Some(route) = self.db.resolve_route(phone_number_id).await? else {
            debug!(phone_number_id, "no agent mapped to phone number");
            return Ok(None);
        };

        let conversation = match self
            .db
            .find_active_conversation(&route.agent_id, customer_phone)
            .await?
        {
            Some(existing) => existing,
            None => {
                let created = self
                    .db
                    .create_conversation(&route.agent_id, customer_phone)
                    .await?;
                info!(
                    conversation_id = %created.conversation_id,
                    agent_id = %route.agent_id,
                    "created conversation for new customer"
                );
                created
            }
        };

        let session = Session {
            user_id: route.user_id,
            agent_id: route.agent_id,
            prompt_id: route.prompt_id,
            conversation_id: conversation.conversation_id,
            openai_conversation_id: conversation.openai_conversation_id,
            access_token: route.access_token,
            meta_phone_number_id: route.meta_phone_number_id,
            platform: route.platform,
        };

        self.store
            .cache_set(&key, &serde_json::to_string(&session)?, Some(self.ttl))
            .await?;
        Ok(Some(session))
    }

    /// Persist the LLM-side conversation id and refresh the cached snapshot.
    /// The DB write is first-writer-wins; the field is immutable afterwards.
    pub async fn update_openai_conversation_id(
        &self,
        phone_number_id: &str,
        customer_phone: &str,
        openai_conversation_id: &str,
        conversation_id: &str,
    ) -> Result<()> {
        self.db
            .set_openai_conversation_id(conversation_id, openai_conversation_id)
            .await
            .context("failed to persist llm conversation id")?;

        let key = session_key(phone_number_id, customer_phone);
        if let Some(raw) = self.store.cache_get(&key).await? {
            if let Ok(mut session) = serde_json::from_str::<Session>(&raw) {
                session.openai_conversation_id = Some(openai_conversation_id.to_string());
                self.store
                    .cache_set(&key, &serde_json::to_string(&session)?, Some(self.ttl))
                    .await?;
            }
        }
        Ok(())
    }

    /// Drop a cached session after an agent, token or phone-number change.
    pub async fn invalidate(&self, phone_number_id: &str, customer_phone: &str) -> Result<()> {
        self.store
            .cache_del(&session_key(phone_number_id, customer_phone))
            .await
    }

    /// Monotone, gap-free sequence numbers within a conversation. Callers
    /// allocate the incoming and outgoing numbers sequentially, under the
    /// conversation lock.
    ///
    /// A fresh counter re-seeds from the persisted maximum so restarts
    /// never reissue a sequence number.
    pub async fn next_sequence_number(&self, conversation_id: &str) -> Result<u64> {
        let key = sequence_key(conversation_id);
        let next = self.store.cache_incr(&key, 1).await?;
        if next == 1 {
            let persisted_max = self.db.max_sequence_no(conversation_id).await?;
            if persisted_max > 0 {
                let seeded = persisted_max + 1;
                self.store
                    .cache_set(&key, &seeded.to_string(), None)
                    .await?;
                return Ok(seeded);
            }
        }
        Ok(next as u64)
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
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockDb {
        route: Option<AgentRoute>,
        conversation: Mutex<Option<ConversationRow>>,
        created: Mutex<u32>,
        max_seq: u64,
        openai_ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Database for MockDb {
        async fn resolve_route(&self, _phone_number_id: &str) -> Result<Option<AgentRoute>> {
            Ok(self.route.clone())
        }
        async fn find_active_conversation(
            &self,
            _agent_id: &str,
            _customer_phone: &str,
        ) -> Result<Option<ConversationRow>> {
            Ok(self.conversation.lock().unwrap().clone())
        }
        async fn create_conversation(
            &self,
            agent_id: &str,
            customer_phone: &str,
        ) -> Result<ConversationRow> {
            *self.created.lock().unwrap() += 1;
            let row = ConversationRow {
                conversation_id: "C1".to_string(),
                agent_id: agent_id.to_string(),
                customer_phone: customer_phone.to_string(),
                openai_conversation_id: None,
            };
            *self.conversation.lock().unwrap() = Some(row.clone());
            Ok(row)
        }
        async fn set_openai_conversation_id(
            &self,
            _conversation_id: &str,
            openai_conversation_id: &str,
        ) -> Result<()> {
            self.openai_ids
                .lock()
                .unwrap()
                .push(openai_conversation_id.to_string());
            Ok(())
        }
        async fn max_sequence_no(&self, _conversation_id: &str) -> Result<u64> {
            Ok(self.max_seq)
        }
        async fn remaining_credits(&self, _user_id: &str) -> Result<Option<i64>> {
            Ok(None)
        }
        async fn deduct_credits(&self, _user_id: &str, _amount: i64) -> Result<Option<i64>> {
            Ok(None)
        }
        async fn insert_message(&self, _record: &MessageRecord) -> Result<()> {
            Ok(())
        }
        async fn upsert_delivery_status(
            &self,
            _message_id: &str,
            _platform_message_id: Option<&str>,
            _status: MessageStatus,
            _error_message: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
        async fn touch_conversation(&self, _conversation_id: &str) -> Result<()> {
            Ok(())
        }
        async fn user_for_conversation(&self, _conversation_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn calendar_tokens(&self, _user_id: &str) -> Result<Option<CalendarTokens>> {
            Ok(None)
        }
        async fn store_calendar_tokens(
            &self,
            _user_id: &str,
            _tokens: &CalendarTokens,
        ) -> Result<()> {
            Ok(())
        }
        async fn insert_meeting(&self, _meeting: &MeetingRecord) -> Result<()> {
            Ok(())
        }
    }

    fn route() -> AgentRoute {
        AgentRoute {
            phone_number_id: "P1".to_string(),
            user_id: "U1".to_string(),
            agent_id: "A1".to_string(),
            prompt_id: "pr1".to_string(),
            access_token: "tok".to_string(),
            meta_phone_number_id: "M1".to_string(),
            platform: Platform::Whatsapp,
        }
    }

    #[tokio::test]
    async fn miss_resolves_route_and_creates_conversation() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb {
            route: Some(route()),
            ..Default::default()
        });
        let cache = SessionCache::new(store, db.clone());

        let session = cache
            .get_or_create("P1", "+15550001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.user_id, "U1");
        assert_eq!(session.conversation_id, "C1");
        assert_eq!(*db.created.lock().unwrap(), 1);

        // Second resolve is served from cache.
        let again = cache
            .get_or_create("P1", "+15550001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.conversation_id, "C1");
        assert_eq!(*db.created.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unmapped_phone_returns_none() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb::default());
        let cache = SessionCache::new(store, db);
        assert!(cache
            .get_or_create("P1", "+15550001")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn invalidate_forces_db_roundtrip() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb {
            route: Some(route()),
            ..Default::default()
        });
        let cache = SessionCache::new(store, db.clone());

        cache.get_or_create("P1", "+15550001").await.unwrap();
        cache.invalidate("P1", "+15550001").await.unwrap();
        cache.get_or_create("P1", "+15550001").await.unwrap();
        // Conversation already exists, so only one create across both misses.
        assert_eq!(*db.created.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn openai_id_update_refreshes_cache() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb {
            route: Some(route()),
            ..Default::default()
        });
        let cache = SessionCache::new(store, db.clone());

        cache.get_or_create("P1", "+15550001").await.unwrap();
        cache
            .update_openai_conversation_id("P1", "+15550001", "oc1", "C1")
            .await
            .unwrap();

        let session = cache
            .get_or_create("P1", "+15550001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.openai_conversation_id.as_deref(), Some("oc1"));
        assert_eq!(db.openai_ids.lock().unwrap().as_slice(), ["oc1"]);
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotone_and_reseeded() {
        let store = MemoryStore::with_defaults();
        let db = Arc::new(MockDb {
            route: Some(route()),
            max_seq: 4,
            ..Default::default()
        });
        let cache = SessionCache::new(store, db);

        // Fresh counter seeds past the persisted maximum.
        assert_eq!(cache.next_sequence_number("C1").await.unwrap(), 5);
        assert_eq!(cache.next_sequence_number("C1").await.unwrap(), 6);
        assert_eq!(cache.next_sequence_number("C1").await.unwrap(), 7);
    }
}
