//! End-to-end pipeline scenarios: one message through dequeue, lock,
//! session resolve, credit check, LLM call, action handling, outbound
//! send and async persistence.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use chatgate::actions::{BookingOutcome, MeetingData, MeetingScheduler};
use chatgate::credits::CreditLedger;
use chatgate::db::{Database, DatabaseConfig, Sender, SqliteDatabase};
use chatgate::llm::{LlmError, LlmErrorCode, LlmReply, LlmRequest, LlmService};
use chatgate::persistence::PersistenceExecutor;
use chatgate::platform::{
    LiveSessionHub, MessageSender, OutboundMessage, SendError, SendOutcome, TypingIndicator,
};
use chatgate::session::SessionCache;
use chatgate::storage::memory::{MemoryStore, MemoryStoreConfig};
use chatgate::storage::{GatewayStore, Platform, QueuedMessage};
use chatgate::utils::Metrics;
use chatgate::worker::{
    ManagerConfig, RateLimitRetrySettings, Worker, WorkerContext, WorkerManager, WorkerSettings,
};

struct MockLlm {
    script: Mutex<VecDeque<Result<LlmReply, LlmError>>>,
    calls: AtomicU32,
    conversations_created: AtomicU32,
    call_delay: Duration,
}

impl MockLlm {
    fn reply(text: &str) -> Result<LlmReply, LlmError> {
        Ok(LlmReply {
            text: text.to_string(),
            tokens_used: 10,
            conversation_id: Some("oc-1".to_string()),
        })
    }

    fn rate_limited() -> Result<LlmReply, LlmError> {
        Err(LlmError::new(LlmErrorCode::RateLimit, "429"))
    }

    fn scripted(script: Vec<Result<LlmReply, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            conversations_created: AtomicU32::new(0),
            call_delay: Duration::ZERO,
        })
    }

    fn scripted_slow(script: Vec<Result<LlmReply, LlmError>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            conversations_created: AtomicU32::new(0),
            call_delay: delay,
        })
    }
}

#[async_trait]
impl LlmService for MockLlm {
    async fn call(&self, _request: &LlmRequest) -> Result<LlmReply, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::new(LlmErrorCode::ServerError, "script exhausted")))
    }

    async fn create_conversation(&self) -> Result<String, LlmError> {
        self.conversations_created.fetch_add(1, Ordering::SeqCst);
        Ok("oc-1".to_string())
    }
}

#[derive(Default)]
struct MockSender {
    sends: Mutex<Vec<OutboundMessage>>,
    typing: Mutex<Vec<TypingIndicator>>,
}

#[async_trait]
impl MessageSender for MockSender {
    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome, SendError> {
        let mut sends = self.sends.lock().unwrap();
        sends.push(message.clone());
        Ok(SendOutcome {
            platform_message_id: Some(format!("wa{}", 122 + sends.len())),
        })
    }

    async fn send_typing_indicator(&self, indicator: &TypingIndicator) -> Result<(), SendError> {
        self.typing.lock().unwrap().push(indicator.clone());
        Ok(())
    }
}

impl MockSender {
    fn sent_texts(&self) -> Vec<String> {
        self.sends.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }
}

struct MockScheduler {
    outcome: BookingOutcome,
    bookings: Mutex<Vec<MeetingData>>,
}

#[async_trait]
impl MeetingScheduler for MockScheduler {
    async fn book_from_model(
        &self,
        _conversation_id: &str,
        meeting: &MeetingData,
    ) -> Result<BookingOutcome> {
        self.bookings.lock().unwrap().push(meeting.clone());
        Ok(self.outcome.clone())
    }
}

struct Pipeline {
    store: Arc<MemoryStore>,
    db: Arc<SqliteDatabase>,
    llm: Arc<MockLlm>,
    sender: Arc<MockSender>,
    scheduler: Arc<MockScheduler>,
    ctx: Arc<WorkerContext>,
    _dir: tempfile::TempDir,
}

async fn pipeline_with(llm: Arc<MockLlm>, store_config: MemoryStoreConfig) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(
        SqliteDatabase::open(&DatabaseConfig {
            path: dir.path().join("gw.db").to_string_lossy().to_string(),
            max_connections: 3,
        })
        .unwrap(),
    );
    db.insert_user("U1", None).await.unwrap();
    db.insert_agent("A1", "U1", "pr1", None).await.unwrap();
    db.insert_phone_number("P1", Some("A1"), "tok", "M1", Platform::Whatsapp)
        .await
        .unwrap();
    db.set_credits("U1", 100).await.unwrap();

    let store = MemoryStore::new(store_config);
    let db_dyn: Arc<dyn Database> = db.clone();
    let sessions = Arc::new(SessionCache::new(store.clone(), db_dyn.clone()));
    let credits = Arc::new(CreditLedger::new(store.clone(), db_dyn.clone()));
    let persistence = Arc::new(PersistenceExecutor::new(db_dyn, credits.clone()));
    let sender = Arc::new(MockSender::default());
    let scheduler = Arc::new(MockScheduler {
        outcome: BookingOutcome::Booked {
            meet_link: Some("https://m/z".to_string()),
        },
        bookings: Mutex::new(Vec::new()),
    });

    let settings = WorkerSettings {
        rate_limit_retry: RateLimitRetrySettings {
            enabled: true,
            retry_delays: vec![
                Duration::from_millis(1),
                Duration::from_millis(1),
                Duration::from_millis(1),
            ],
            initial_message: "busy".to_string(),
            final_message: "later".to_string(),
        },
        ..Default::default()
    };

    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        sessions,
        credits,
        llm: llm.clone(),
        sender: sender.clone(),
        scheduler: scheduler.clone(),
        persistence,
        live: Arc::new(LiveSessionHub::new()),
        metrics: Arc::new(Metrics::new().unwrap()),
        settings,
    });

    Pipeline {
        store,
        db,
        llm,
        sender,
        scheduler,
        ctx,
        _dir: dir,
    }
}

async fn pipeline(llm: Arc<MockLlm>) -> Pipeline {
    pipeline_with(llm, MemoryStoreConfig::default()).await
}

fn inbound(message_id: &str, text: &str) -> QueuedMessage {
    QueuedMessage::new(message_id, "P1", "+15550001", text, Platform::Whatsapp)
}

fn test_worker(ctx: &Arc<WorkerContext>) -> Worker {
    let (_tx, rx) = watch::channel(false);
    Worker::new(ctx.clone(), rx)
}

/// Let fire-and-forget persistence tasks land.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

#[tokio::test]
async fn s1_happy_path_whatsapp() {
    let p = pipeline(MockLlm::scripted(vec![MockLlm::reply("Hi!")])).await;
    let worker = test_worker(&p.ctx);

    assert!(p.store.enqueue(inbound("m1", "Hello")).await.unwrap());
    let (message, lease) = p.store.dequeue(None).await.unwrap().unwrap();
    worker.process(message, lease).await;
    settle().await;

    // Exactly one customer-facing send, with the session's credentials.
    let sends = p.sender.sends.lock().unwrap().clone();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].meta_phone_number_id, "M1");
    assert_eq!(sends[0].customer_phone, "+15550001");
    assert_eq!(sends[0].text, "Hi!");
    assert_eq!(sends[0].platform, Platform::Whatsapp);
    assert_eq!(sends[0].access_token, "tok");

    // Both message rows persisted with contiguous sequence numbers.
    let conv = p
        .db
        .find_active_conversation("A1", "+15550001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conv.openai_conversation_id.as_deref(), Some("oc-1"));

    let messages = p
        .db
        .messages_for_conversation(&conv.conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender, Sender::User);
    assert_eq!(messages[0].text, "Hello");
    assert_eq!(messages[0].sequence_no, 1);
    assert_eq!(messages[1].sender, Sender::Agent);
    assert_eq!(messages[1].text, "Hi!");
    assert_eq!(messages[1].sequence_no, 2);
    assert_eq!(messages[1].platform_message_id.as_deref(), Some("wa123"));

    // One credit debited.
    assert_eq!(p.db.remaining_credits("U1").await.unwrap(), Some(99));

    // Lease settled: nothing left in the queue or in flight.
    let stats = p.store.queue_stats().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn s2_insufficient_credits_drops_silently() {
    let p = pipeline(MockLlm::scripted(vec![MockLlm::reply("Hi!")])).await;
    p.db.set_credits("U1", 0).await.unwrap();
    let worker = test_worker(&p.ctx);

    p.store.enqueue(inbound("m1", "Hello")).await.unwrap();
    let (message, lease) = p.store.dequeue(None).await.unwrap().unwrap();
    worker.process(message, lease).await;
    settle().await;

    // No LLM call, no send, no rows, no debit.
    assert_eq!(p.llm.calls.load(Ordering::SeqCst), 0);
    assert!(p.sender.sends.lock().unwrap().is_empty());
    let conv = p
        .db
        .find_active_conversation("A1", "+15550001")
        .await
        .unwrap()
        .unwrap();
    assert!(p
        .db
        .messages_for_conversation(&conv.conversation_id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(p.db.remaining_credits("U1").await.unwrap(), Some(0));

    // Lease completed, not retried.
    let stats = p.store.queue_stats().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn s3_rate_limit_recovery_with_user_notices() {
    let p = pipeline(MockLlm::scripted(vec![
        MockLlm::rate_limited(),
        MockLlm::rate_limited(),
        MockLlm::rate_limited(),
        MockLlm::reply("Hi!"),
    ]))
    .await;
    let worker = test_worker(&p.ctx);

    p.store.enqueue(inbound("m1", "Hello")).await.unwrap();
    let (message, lease) = p.store.dequeue(None).await.unwrap().unwrap();
    worker.process(message, lease).await;
    settle().await;

    // Busy notice first, then the real reply.
    assert_eq!(p.sender.sent_texts(), vec!["busy", "Hi!"]);

    // Credits debited exactly once; one outgoing row persisted.
    assert_eq!(p.db.remaining_credits("U1").await.unwrap(), Some(99));
    let conv = p
        .db
        .find_active_conversation("A1", "+15550001")
        .await
        .unwrap()
        .unwrap();
    let messages = p
        .db
        .messages_for_conversation(&conv.conversation_id)
        .await
        .unwrap();
    let outgoing: Vec<_> = messages.iter().filter(|m| m.sender == Sender::Agent).collect();
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].text, "Hi!");
}

#[tokio::test]
async fn s3b_rate_limit_exhaustion_sends_final_notice_and_completes() {
    let p = pipeline(MockLlm::scripted(vec![
        MockLlm::rate_limited(),
        MockLlm::rate_limited(),
        MockLlm::rate_limited(),
        MockLlm::rate_limited(),
    ]))
    .await;
    let worker = test_worker(&p.ctx);

    p.store.enqueue(inbound("m1", "Hello")).await.unwrap();
    let (message, lease) = p.store.dequeue(None).await.unwrap().unwrap();
    worker.process(message, lease).await;
    settle().await;

    assert_eq!(p.sender.sent_texts(), vec!["busy", "later"]);
    // No debit when the model never answered.
    assert_eq!(p.db.remaining_credits("U1").await.unwrap(), Some(100));
    // The job terminates without re-drive.
    let stats = p.store.queue_stats().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn s4_meeting_action_booked_and_confirmed() {
    let action = r#"{"action":"Time_to_121meet","name":"Joe","email":"j@x","title":"Demo","participants":["j@x"],"meeting_time":"2025-10-06T19:00:00+05:30","friendly_time":"Mon 7 PM"}"#;
    let reply = format!("Let me schedule\n{}", action);
    let p = pipeline(MockLlm::scripted(vec![MockLlm::reply(&reply)])).await;
    let worker = test_worker(&p.ctx);

    p.store.enqueue(inbound("m1", "book it")).await.unwrap();
    let (message, lease) = p.store.dequeue(None).await.unwrap().unwrap();
    worker.process(message, lease).await;
    settle().await;

    let texts = p.sender.sent_texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("Let me schedule"));
    assert!(texts[0].contains("Meeting confirmed"));
    assert!(texts[0].contains("https://m/z"));
    // The raw action JSON never reaches the customer.
    assert!(!texts[0].contains("Time_to_121meet"));

    let bookings = p.scheduler.bookings.lock().unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].title, "Demo");
}

#[tokio::test]
async fn s5_lock_serializes_same_customer_messages() {
    let llm = MockLlm::scripted_slow(
        vec![MockLlm::reply("R1"), MockLlm::reply("R2")],
        Duration::from_millis(100),
    );
    let p = pipeline(llm).await;

    p.store.enqueue(inbound("m1", "Hello-1")).await.unwrap();
    p.store.enqueue(inbound("m2", "Hello-2")).await.unwrap();

    let (first, lease1) = p.store.dequeue(None).await.unwrap().unwrap();
    let (second, lease2) = p.store.dequeue(None).await.unwrap().unwrap();
    assert_eq!(first.message_id, "m1");
    assert_eq!(second.message_id, "m2");

    let w1 = test_worker(&p.ctx);
    let w2 = test_worker(&p.ctx);

    let t1 = tokio::spawn(async move { w1.process(first, lease1).await });
    // Give the first worker time to take the customer lock.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let t2 = tokio::spawn(async move { w2.process(second, lease2).await });
    let _ = tokio::join!(t1, t2);
    settle().await;

    let conv = p
        .db
        .find_active_conversation("A1", "+15550001")
        .await
        .unwrap()
        .unwrap();
    let messages = p
        .db
        .messages_for_conversation(&conv.conversation_id)
        .await
        .unwrap();

    // No interleaving: incoming-1, outgoing-2, incoming-3, outgoing-4.
    let expected = [
        (1u64, Sender::User, "Hello-1"),
        (2, Sender::Agent, "R1"),
        (3, Sender::User, "Hello-2"),
        (4, Sender::Agent, "R2"),
    ];
    assert_eq!(messages.len(), expected.len());
    for (record, (seq, sender, text)) in messages.iter().zip(expected.iter()) {
        assert_eq!(record.sequence_no, *seq);
        assert_eq!(record.sender, *sender);
        assert_eq!(record.text, *text);
    }
}

#[tokio::test]
async fn s6_expired_lease_is_reprocessed_once() {
    let llm = MockLlm::scripted(vec![MockLlm::reply("Hi!")]);
    let p = pipeline_with(
        llm,
        MemoryStoreConfig {
            lease_ttl: Duration::ZERO,
            ..Default::default()
        },
    )
    .await;

    p.store.enqueue(inbound("m1", "Hello")).await.unwrap();

    // First worker dies after dequeue: the lease is never settled.
    let (_abandoned, _lease) = p.store.dequeue(None).await.unwrap().unwrap();
    p.store.sweep_expired().await;

    let (recovered, lease) = p.store.dequeue(None).await.unwrap().unwrap();
    assert_eq!(recovered.message_id, "m1");
    assert_eq!(recovered.retry_count, 1);

    let worker = test_worker(&p.ctx);
    worker.process(recovered, lease).await;
    settle().await;

    assert_eq!(p.sender.sent_texts(), vec!["Hi!"]);
    // The crashed worker never debited, so the balance drops exactly once.
    assert_eq!(p.db.remaining_credits("U1").await.unwrap(), Some(99));
}

#[tokio::test]
async fn manager_processes_enqueued_messages_end_to_end() {
    let p = pipeline(MockLlm::scripted(vec![MockLlm::reply("Hi!")])).await;

    let manager = WorkerManager::new(
        p.ctx.clone(),
        ManagerConfig {
            initial_workers: 2,
            drain_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    );
    manager.start().await;
    assert_eq!(manager.worker_count().await, 2);

    p.store.enqueue(inbound("m1", "Hello")).await.unwrap();

    // Event-driven dispatch should settle the message without polling.
    let mut settled = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = p.store.queue_stats().await.unwrap();
        if stats.completed == 1 && stats.queued == 0 && stats.processing == 0 {
            settled = true;
            break;
        }
    }
    assert!(settled, "manager never settled the enqueued message");
    assert_eq!(p.sender.sent_texts(), vec!["Hi!"]);

    manager.shutdown().await;
    assert_eq!(manager.worker_count().await, 0);
}

#[tokio::test]
async fn webchat_replies_reach_the_live_hub() {
    let p = pipeline(MockLlm::scripted(vec![MockLlm::reply("Hi!")])).await;
    p.db.insert_phone_number("P2", Some("A1"), "tok", "M2", Platform::Webchat)
        .await
        .unwrap();

    // Subscribe before processing so the push has a receiver.
    let conv = p.db.create_conversation("A1", "+15550002").await.unwrap();
    let mut live_rx = p.ctx.live.subscribe(&conv.conversation_id).await;

    let message = QueuedMessage::new("m1", "P2", "+15550002", "Hello", Platform::Webchat);
    p.store.enqueue(message).await.unwrap();
    let (message, lease) = p.store.dequeue(None).await.unwrap().unwrap();
    let worker = test_worker(&p.ctx);
    worker.process(message, lease).await;

    let event = tokio::time::timeout(Duration::from_secs(1), live_rx.recv())
        .await
        .expect("live event within a second")
        .unwrap();
    assert_eq!(event.text, "Hi!");
    assert_eq!(event.conversation_id, conv.conversation_id);
}
