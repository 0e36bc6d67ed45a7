use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::credits::CreditLedger;
use crate::db::{Database, MessageRecord, MessageStatus, Sender};

/// Fire-and-forget writes scheduled after the outbound send is already
/// acknowledged. Failures are logged with the correlation id and never
/// surface to the customer; each task carries its own error handler.
pub struct PersistenceExecutor {
    db: Arc<dyn Database>,
    ledger: Arc<CreditLedger>,
}

impl PersistenceExecutor {
    pub fn new(db: Arc<dyn Database>, ledger: Arc<CreditLedger>) -> Self {
        Self { db, ledger }
    }

    pub fn store_incoming_message(
        &self,
        message_id: String,
        conversation_id: String,
        text: String,
        sequence_no: u64,
    ) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            let record = MessageRecord {
                message_id: message_id.clone(),
                conversation_id,
                sender: Sender::User,
                text,
                status: MessageStatus::Sent,
                sequence_no,
                platform_message_id: None,
                timestamp: Utc::now(),
            };
            match db.insert_message(&record).await {
                Ok(()) => debug!(message_id = %message_id, sequence_no, "incoming message stored"),
                Err(e) => error!(message_id = %message_id, error = %e, "failed to store incoming message"),
            }
        })
    }

    pub fn store_outgoing_message(
        &self,
        message_id: String,
        conversation_id: String,
        text: String,
        sequence_no: u64,
        platform_message_id: Option<String>,
    ) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            let record = MessageRecord {
                message_id: message_id.clone(),
                conversation_id,
                sender: Sender::Agent,
                text,
                status: MessageStatus::Sent,
                sequence_no,
                platform_message_id,
                timestamp: Utc::now(),
            };
            match db.insert_message(&record).await {
                Ok(()) => debug!(message_id = %message_id, sequence_no, "outgoing message stored"),
                Err(e) => error!(message_id = %message_id, error = %e, "failed to store outgoing message"),
            }
        })
    }

    pub fn track_delivery(
        &self,
        message_id: String,
        platform_message_id: Option<String>,
        status: MessageStatus,
    ) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db
                .upsert_delivery_status(&message_id, platform_message_id.as_deref(), status, None)
                .await
            {
                error!(message_id = %message_id, error = %e, "failed to track delivery");
            }
        })
    }

    pub fn update_conversation_activity(&self, conversation_id: String) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.touch_conversation(&conversation_id).await {
                error!(conversation_id = %conversation_id, error = %e, "failed to update conversation activity");
            }
        })
    }

    /// Must eventually succeed for accounting correctness, but never blocks
    /// the reply path.
    pub fn deduct_credits(&self, user_id: String, amount: i64) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        tokio::spawn(async move {
            if let Err(e) = ledger.deduct(&user_id, amount).await {
                error!(user_id = %user_id, amount, error = %e, "credit debit failed");
            }
        })
    }
}
