use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actions::{detect_meeting_action, BookingOutcome, MeetingScheduler};
use crate::credits::CreditLedger;
use crate::db::MessageStatus;
use crate::llm::{LlmErrorCode, LlmReply, LlmRequest, LlmService};
use crate::persistence::PersistenceExecutor;
use crate::platform::{
    LiveEvent, LiveSessionHub, MessageSender, OutboundMessage, SendErrorCode, TypingIndicator,
};
use crate::session::{Session, SessionCache};
use crate::storage::{
    customer_lock_resource, GatewayStore, Platform, ProcessingLease, QueuedMessage,
};
use crate::utils::metrics::Metrics;

/// Outcome of one message's trip through the pipeline; drives the final
/// lease disposition. No error crosses the worker boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    Success,
    LockFailed,
    InsufficientCredits,
    LlmFailed(LlmErrorCode),
    /// Outer rate-limit recovery ran out of delays; the customer already
    /// got the final try-later message.
    RateLimitExhausted,
    SendFailed(SendErrorCode),
    MissingAgent,
    Invalid(String),
    Internal(String),
}

/// What to do with the lease once processing settles.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseDisposition {
    Complete,
    FailRetry(String),
    FailDrop(String),
}

impl ProcessResult {
    pub fn disposition(&self) -> LeaseDisposition {
        match self {
            ProcessResult::Success | ProcessResult::RateLimitExhausted => {
                LeaseDisposition::Complete
            }
            // Business-rule halts: silent to the customer, no re-drive.
            ProcessResult::MissingAgent | ProcessResult::InsufficientCredits => {
                LeaseDisposition::Complete
            }
            ProcessResult::LockFailed => LeaseDisposition::FailRetry("lock".to_string()),
            ProcessResult::LlmFailed(code) => {
                if code.is_retryable() {
                    LeaseDisposition::FailRetry(format!("llm:{}", code.as_str()))
                } else {
                    // Permanent external failure: no re-drive.
                    LeaseDisposition::Complete
                }
            }
            ProcessResult::SendFailed(code) => {
                if code.is_retryable() {
                    LeaseDisposition::FailRetry(format!("send:{}", code.as_str()))
                } else {
                    LeaseDisposition::Complete
                }
            }
            ProcessResult::Invalid(reason) => LeaseDisposition::FailDrop(reason.clone()),
            ProcessResult::Internal(reason) => LeaseDisposition::FailRetry(reason.clone()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessResult::Success | ProcessResult::RateLimitExhausted)
    }
}

/// Worker-level rate-limit recovery with user-visible messages, distinct
/// from the LLM client's silent backoff.
#[derive(Debug, Clone)]
pub struct RateLimitRetrySettings {
    pub enabled: bool,
    pub retry_delays: Vec<Duration>,
    pub initial_message: String,
    pub final_message: String,
}

impl Default for RateLimitRetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_delays: vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
            ],
            initial_message: "We're experiencing high demand right now. Give me a moment and I'll get back to you."
                .to_string(),
            final_message: "I'm still overloaded, sorry! Please try again in a few minutes."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub lock_ttl: Duration,
    pub lock_max_retries: u32,
    /// Credits debited per processed message.
    pub credit_cost: i64,
    pub rate_limit_retry: RateLimitRetrySettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(300),
            lock_max_retries: 150,
            credit_cost: 1,
            rate_limit_retry: RateLimitRetrySettings::default(),
        }
    }
}

/// Explicit dependency container handed to every worker; there are no
/// process-wide singletons behind it.
pub struct WorkerContext {
    pub store: Arc<dyn GatewayStore>,
    pub sessions: Arc<SessionCache>,
    pub credits: Arc<CreditLedger>,
    pub llm: Arc<dyn LlmService>,
    pub sender: Arc<dyn MessageSender>,
    pub scheduler: Arc<dyn MeetingScheduler>,
    pub persistence: Arc<PersistenceExecutor>,
    pub live: Arc<LiveSessionHub>,
    pub metrics: Arc<Metrics>,
    pub settings: WorkerSettings,
}

/// Success/failure bookkeeping per worker, with a sliding window feeding
/// the manager's restart decision.
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    window: Mutex<std::collections::VecDeque<bool>>,
    last_heartbeat: Mutex<Instant>,
    started_at: Instant,
}

const STATS_WINDOW: usize = 20;

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            window: Mutex::new(std::collections::VecDeque::with_capacity(STATS_WINDOW)),
            last_heartbeat: Mutex::new(Instant::now()),
            started_at: Instant::now(),
        }
    }

    pub async fn record(&self, success: bool) {
        if success {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut window = self.window.lock().await;
        if window.len() == STATS_WINDOW {
            window.pop_front();
        }
        window.push_back(success);
    }

    pub async fn heartbeat(&self) {
        *self.last_heartbeat.lock().await = Instant::now();
    }

    /// Success rate over the sliding window; 1.0 while the window is
    /// too thin to judge.
    pub async fn success_rate(&self) -> f64 {
        let window = self.window.lock().await;
        if window.len() < STATS_WINDOW / 2 {
            return 1.0;
        }
        let ok = window.iter().filter(|s| **s).count();
        ok as f64 / window.len() as f64
    }

    pub async fn snapshot(&self, worker_id: &str) -> WorkerHealth {
        WorkerHealth {
            worker_id: worker_id.to_string(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            success_rate: self.success_rate().await,
            seconds_since_heartbeat: self.last_heartbeat.lock().await.elapsed().as_secs(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub processed: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub seconds_since_heartbeat: u64,
    pub uptime_seconds: u64,
}

/// Services one message at a time to completion; the manager runs many
/// workers in parallel.
pub struct Worker {
    pub id: String,
    ctx: Arc<WorkerContext>,
    pub stats: Arc<WorkerStats>,
    pub wake: Arc<Notify>,
    /// Individual kill switch for scale-down and restart.
    pub active: Arc<std::sync::atomic::AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            ctx,
            stats: Arc::new(WorkerStats::new()),
            wake: Arc::new(Notify::new()),
            active: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            shutdown,
        }
    }

    /// Event-driven main loop: drain the queue, then sleep until the
    /// manager wakes us or shutdown flips.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, "worker started");
        loop {
            if *self.shutdown.borrow() || !self.active.load(Ordering::Relaxed) {
                break;
            }
            match self.ctx.store.dequeue(None).await {
                Ok(Some((message, lease))) => {
                    self.process(message, lease).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// One message end-to-end. Every exit path settles the lease; the lock
    /// release lives in the guaranteed block around the handler.
    pub async fn process(&self, message: QueuedMessage, lease: ProcessingLease) {
        self.stats.heartbeat().await;
        let started = Instant::now();
        let message_id = message.message_id.clone();

        let result = if let Err(reason) = message.validate() {
            ProcessResult::Invalid(reason)
        } else {
            self.process_locked(&message).await
        };

        let success = result.is_success();
        match result.disposition() {
            LeaseDisposition::Complete => {
                if let Err(e) = self.ctx.store.complete(&lease).await {
                    error!(message_id = %message_id, error = %e, "lease completion failed");
                }
            }
            LeaseDisposition::FailRetry(reason) => {
                if let Err(e) = self.ctx.store.fail(&lease, &reason, true).await {
                    error!(message_id = %message_id, error = %e, "lease fail failed");
                }
            }
            LeaseDisposition::FailDrop(reason) => {
                if let Err(e) = self.ctx.store.fail(&lease, &reason, false).await {
                    error!(message_id = %message_id, error = %e, "lease fail failed");
                }
            }
        }

        self.stats.record(success).await;
        if success {
            self.ctx.metrics.messages_processed.inc();
        } else {
            self.ctx.metrics.messages_failed.inc();
        }
        debug!(
            worker_id = %self.id,
            message_id = %message_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            result = ?std::mem::discriminant(&result),
            "message settled"
        );
    }

    /// Serialize on the per-customer lock, then run the pipeline. The lock
    /// is released on every path, panics included.
    async fn process_locked(&self, message: &QueuedMessage) -> ProcessResult {
        let resource = customer_lock_resource(&message.phone_number_id, &message.customer_phone);
        let lock = match self
            .ctx
            .store
            .acquire_lock(
                &resource,
                self.ctx.settings.lock_ttl,
                self.ctx.settings.lock_max_retries,
            )
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => return ProcessResult::LockFailed,
            Err(e) => return ProcessResult::Internal(format!("lock acquire: {}", e)),
        };

        let result = AssertUnwindSafe(self.handle(message)).catch_unwind().await;
        if let Err(e) = self.ctx.store.release_lock(&lock).await {
            error!(resource = %resource, error = %e, "lock release failed");
        }

        match result {
            Ok(result) => result,
            Err(_) => {
                error!(message_id = %message.message_id, "panic in message handler");
                ProcessResult::Internal("panic in message handler".to_string())
            }
        }
    }

    async fn handle(&self, message: &QueuedMessage) -> ProcessResult {
        let ctx = &self.ctx;

        // Resolve tenant, agent, prompt and credentials in one snapshot.
        let session = match ctx
            .sessions
            .get_or_create(&message.phone_number_id, &message.customer_phone)
            .await
        {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!(
                    message_id = %message.message_id,
                    phone_number_id = %message.phone_number_id,
                    "no agent mapped, orphaning message"
                );
                return ProcessResult::MissingAgent;
            }
            Err(e) => return ProcessResult::Internal(format!("session resolve: {}", e)),
        };

        self.dispatch_typing_indicator(message, &session);

        match ctx
            .credits
            .has_enough(&session.user_id, ctx.settings.credit_cost)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    user_id = %session.user_id,
                    message_id = %message.message_id,
                    "insufficient credits, dropping message silently"
                );
                return ProcessResult::InsufficientCredits;
            }
            Err(e) => return ProcessResult::Internal(format!("credit check: {}", e)),
        }

        // Sequential allocation keeps incoming/outgoing contiguous.
        let incoming_seq = match ctx
            .sessions
            .next_sequence_number(&session.conversation_id)
            .await
        {
            Ok(seq) => seq,
            Err(e) => return ProcessResult::Internal(format!("sequence: {}", e)),
        };
        let outgoing_seq = match ctx
            .sessions
            .next_sequence_number(&session.conversation_id)
            .await
        {
            Ok(seq) => seq,
            Err(e) => return ProcessResult::Internal(format!("sequence: {}", e)),
        };

        ctx.persistence.store_incoming_message(
            message.message_id.clone(),
            session.conversation_id.clone(),
            message.message_text.clone(),
            incoming_seq,
        );

        let llm_conversation_id = match self.ensure_llm_conversation(message, &session).await {
            Ok(id) => id,
            Err(result) => return result,
        };

        let reply = match self.call_llm(message, &session, &llm_conversation_id).await {
            Ok(reply) => reply,
            Err(result) => return result,
        };

        let final_text = self.apply_actions(&session, reply.text).await;

        let outbound = OutboundMessage {
            phone_number_id: message.phone_number_id.clone(),
            customer_phone: message.customer_phone.clone(),
            text: final_text.clone(),
            platform: session.platform,
            access_token: session.access_token.clone(),
            meta_phone_number_id: session.meta_phone_number_id.clone(),
        };
        let outcome = match ctx.sender.send(&outbound).await {
            Ok(outcome) => outcome,
            Err(e) => {
                ctx.metrics
                    .send_failures
                    .with_label_values(&[session.platform.as_str()])
                    .inc();
                return ProcessResult::SendFailed(e.code);
            }
        };

        let outgoing_message_id = Uuid::new_v4().to_string();

        if session.platform == Platform::Webchat {
            ctx.live
                .publish(LiveEvent {
                    conversation_id: session.conversation_id.clone(),
                    message_id: outgoing_message_id.clone(),
                    text: final_text.clone(),
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }

        ctx.persistence.store_outgoing_message(
            outgoing_message_id.clone(),
            session.conversation_id.clone(),
            final_text,
            outgoing_seq,
            outcome.platform_message_id.clone(),
        );
        ctx.persistence.track_delivery(
            outgoing_message_id,
            outcome.platform_message_id,
            MessageStatus::Sent,
        );
        ctx.persistence
            .update_conversation_activity(session.conversation_id.clone());
        ctx.persistence
            .deduct_credits(session.user_id.clone(), ctx.settings.credit_cost);

        ProcessResult::Success
    }

    /// Fire-and-forget: the customer sees activity within milliseconds
    /// while the pipeline does its work.
    fn dispatch_typing_indicator(&self, message: &QueuedMessage, session: &Session) {
        let sender = self.ctx.sender.clone();
        let indicator = TypingIndicator {
            platform: session.platform,
            customer_phone: message.customer_phone.clone(),
            access_token: session.access_token.clone(),
            meta_phone_number_id: session.meta_phone_number_id.clone(),
            inbound_message_id: Some(message.message_id.clone()),
        };
        tokio::spawn(async move {
            if let Err(e) = sender.send_typing_indicator(&indicator).await {
                debug!(error = %e, "typing indicator failed");
            }
        });
    }

    /// Materialize the LLM-side conversation id on first use.
    async fn ensure_llm_conversation(
        &self,
        message: &QueuedMessage,
        session: &Session,
    ) -> Result<String, ProcessResult> {
        if let Some(existing) = &session.openai_conversation_id {
            return Ok(existing.clone());
        }
        let created = self
            .ctx
            .llm
            .create_conversation()
            .await
            .map_err(|e| ProcessResult::LlmFailed(e.code))?;
        if let Err(e) = self
            .ctx
            .sessions
            .update_openai_conversation_id(
                &message.phone_number_id,
                &message.customer_phone,
                &created,
                &session.conversation_id,
            )
            .await
        {
            return Err(ProcessResult::Internal(format!(
                "persist llm conversation id: {}",
                e
            )));
        }
        Ok(created)
    }

    /// Inner client retry is silent; this is the outer, user-visible
    /// rate-limit protocol.
    async fn call_llm(
        &self,
        message: &QueuedMessage,
        session: &Session,
        llm_conversation_id: &str,
    ) -> Result<LlmReply, ProcessResult> {
        let ctx = &self.ctx;
        let request = LlmRequest {
            message_text: message.message_text.clone(),
            conversation_id: Some(llm_conversation_id.to_string()),
            prompt_id: session.prompt_id.clone(),
            user_id: Some(session.user_id.clone()),
        };

        let llm_started = Instant::now();
        let first = ctx.llm.call(&request).await;
        ctx.metrics
            .llm_latency
            .observe(llm_started.elapsed().as_secs_f64());

        let retry_cfg = &ctx.settings.rate_limit_retry;
        match first {
            Ok(reply) => Ok(reply),
            Err(err) if err.code == LlmErrorCode::RateLimit && retry_cfg.enabled => {
                info!(
                    message_id = %message.message_id,
                    "llm rate limited, entering user-visible retry protocol"
                );
                self.send_notice(message, session, &retry_cfg.initial_message)
                    .await;

                for (i, delay) in retry_cfg.retry_delays.iter().enumerate() {
                    tokio::time::sleep(*delay).await;
                    match ctx.llm.call(&request).await {
                        Ok(reply) => {
                            info!(attempt = i + 1, "llm recovered from rate limit");
                            return Ok(reply);
                        }
                        Err(e) if e.code == LlmErrorCode::RateLimit => continue,
                        Err(e) => return Err(ProcessResult::LlmFailed(e.code)),
                    }
                }

                self.send_notice(message, session, &retry_cfg.final_message)
                    .await;
                Err(ProcessResult::RateLimitExhausted)
            }
            Err(err) => Err(ProcessResult::LlmFailed(err.code)),
        }
    }

    /// Prewritten busy/try-later copy; a failed notice is log-only.
    async fn send_notice(&self, message: &QueuedMessage, session: &Session, text: &str) {
        let outbound = OutboundMessage {
            phone_number_id: message.phone_number_id.clone(),
            customer_phone: message.customer_phone.clone(),
            text: text.to_string(),
            platform: session.platform,
            access_token: session.access_token.clone(),
            meta_phone_number_id: session.meta_phone_number_id.clone(),
        };
        if let Err(e) = self.ctx.sender.send(&outbound).await {
            warn!(error = %e, "failed to deliver service notice");
        }
    }

    /// Detect and execute an embedded booking action; adjust the
    /// user-facing text either way.
    async fn apply_actions(&self, session: &Session, reply_text: String) -> String {
        let detection = detect_meeting_action(&reply_text);
        let Some(meeting) = detection.meeting else {
            return detection.cleaned_response;
        };

        match self
            .ctx
            .scheduler
            .book_from_model(&session.conversation_id, &meeting)
            .await
        {
            Ok(BookingOutcome::Booked { meet_link }) => {
                let mut text = format!(
                    "{}\n\nMeeting confirmed for {}.",
                    detection.cleaned_response, meeting.friendly_time
                );
                if let Some(link) = meet_link {
                    text.push_str(&format!(" Join here: {}", link));
                }
                text
            }
            Ok(BookingOutcome::Unavailable { message }) => {
                format!("{}\n\n{}", detection.cleaned_response, message)
            }
            Err(e) => {
                // Soft side-effect failure: the reply still goes out.
                warn!(error = %e, "booking attempt errored");
                detection.cleaned_response
            }
        }
    }
}
