use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::info;
use uuid::Uuid;

use crate::storage::Platform;

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Agent,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Sender::User),
            "agent" => Ok(Sender::Agent),
            _ => bail!("invalid sender: {}", s),
        }
    }
}

/// Delivery status of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "failed" => Ok(MessageStatus::Failed),
            _ => bail!("invalid message status: {}", s),
        }
    }
}

/// One row of the `messages` table. `(conversation_id, sequence_no)` is
/// unique; sequence numbers are assigned under the conversation lock.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub text: String,
    pub status: MessageStatus,
    pub sequence_no: u64,
    pub platform_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Resolved routing for a platform phone number: the owning agent, its
/// user, the prompt and the platform credentials in one snapshot.
#[derive(Debug, Clone)]
pub struct AgentRoute {
    pub phone_number_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub prompt_id: String,
    pub access_token: String,
    pub meta_phone_number_id: String,
    pub platform: Platform,
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub agent_id: String,
    pub customer_phone: String,
    pub openai_conversation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CalendarTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MeetingRecord {
    pub meeting_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub google_event_id: String,
    pub title: String,
    pub meeting_time: String,
    pub meet_link: Option<String>,
    pub status: String,
}

/// The exact persistence surface the pipeline needs. No escape hatch to
/// the underlying connection; callers hold ids, not row objects.
#[async_trait]
pub trait Database: Send + Sync {
    async fn resolve_route(&self, phone_number_id: &str) -> Result<Option<AgentRoute>>;
    async fn find_active_conversation(
        &self,
        agent_id: &str,
        customer_phone: &str,
    ) -> Result<Option<ConversationRow>>;
    async fn create_conversation(
        &self,
        agent_id: &str,
        customer_phone: &str,
    ) -> Result<ConversationRow>;
    async fn set_openai_conversation_id(
        &self,
        conversation_id: &str,
        openai_conversation_id: &str,
    ) -> Result<()>;
    async fn max_sequence_no(&self, conversation_id: &str) -> Result<u64>;

    async fn remaining_credits(&self, user_id: &str) -> Result<Option<i64>>;
    /// Atomic conditional decrement. `Ok(None)` means the balance was too
    /// low and nothing changed.
    async fn deduct_credits(&self, user_id: &str, amount: i64) -> Result<Option<i64>>;

    async fn insert_message(&self, record: &MessageRecord) -> Result<()>;
    async fn upsert_delivery_status(
        &self,
        message_id: &str,
        platform_message_id: Option<&str>,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<()>;
    async fn touch_conversation(&self, conversation_id: &str) -> Result<()>;

    async fn user_for_conversation(&self, conversation_id: &str) -> Result<Option<String>>;
    async fn calendar_tokens(&self, user_id: &str) -> Result<Option<CalendarTokens>>;
    async fn store_calendar_tokens(&self, user_id: &str, tokens: &CalendarTokens) -> Result<()>;
    async fn insert_meeting(&self, meeting: &MeetingRecord) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "chatgate.db".to_string(),
            max_connections: 10,
        }
    }
}

/// SQLite connection pool with semaphore-gated checkout and WAL pragmas.
struct ConnectionPool {
    connections: Arc<Mutex<Vec<Arc<Mutex<Connection>>>>>,
    semaphore: Arc<Semaphore>,
    database_path: String,
    max_connections: usize,
}

impl ConnectionPool {
    fn new(database_path: String, max_connections: usize) -> Result<Self> {
        let pool = Self {
            connections: Arc::new(Mutex::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            database_path,
            max_connections,
        };

        {
            let mut connections = pool.connections.lock().unwrap();
            for _ in 0..std::cmp::min(3, pool.max_connections) {
                connections.push(Arc::new(Mutex::new(pool.create_connection()?)));
            }
        }
        Ok(pool)
    }

    fn create_connection(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.database_path, flags)
            .with_context(|| format!("failed to open database: {}", self.database_path))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    async fn get(&self) -> Result<PooledConnection<'_>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .context("connection pool closed")?;

        let conn = loop {
            let existing = {
                let mut connections = self.connections.lock().unwrap();
                connections.pop()
            };
            if let Some(conn) = existing {
                break conn;
            }
            let count = self.connections.lock().unwrap().len();
            if count < self.max_connections {
                break Arc::new(Mutex::new(self.create_connection()?));
            }
            sleep(Duration::from_millis(10)).await;
        };

        Ok(PooledConnection {
            connection: conn,
            pool: self.connections.clone(),
            _permit: permit,
        })
    }
}

struct PooledConnection<'a> {
    connection: Arc<Mutex<Connection>>,
    pool: Arc<Mutex<Vec<Arc<Mutex<Connection>>>>>,
    _permit: tokio::sync::SemaphorePermit<'a>,
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        self.pool.lock().unwrap().push(self.connection.clone());
    }
}

impl PooledConnection<'_> {
    fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.connection.lock().unwrap();
        f(&conn)
    }
}

/// SQLite-backed [`Database`].
pub struct SqliteDatabase {
    pool: ConnectionPool,
}

impl SqliteDatabase {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let db = Self {
            pool: ConnectionPool::new(config.path.clone(), config.max_connections)?,
        };
        db.init_schema()?;
        info!(path = %config.path, "sqlite database ready");
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let connections = self.pool.connections.lock().unwrap();
        let conn = connections
            .first()
            .context("connection pool is empty during schema init")?;
        let conn = conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                email TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(user_id),
                prompt_id TEXT NOT NULL,
                name TEXT
            );
            CREATE TABLE IF NOT EXISTS phone_numbers (
                phone_number_id TEXT PRIMARY KEY,
                agent_id TEXT REFERENCES agents(agent_id),
                access_token TEXT NOT NULL,
                meta_phone_number_id TEXT NOT NULL,
                platform TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(agent_id),
                customer_phone TEXT NOT NULL,
                openai_conversation_id TEXT,
                created_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_active
                ON conversations(agent_id, customer_phone) WHERE is_active = 1;
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id),
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                status TEXT NOT NULL,
                sequence_no INTEGER NOT NULL,
                platform_message_id TEXT,
                timestamp TEXT NOT NULL,
                UNIQUE(conversation_id, sequence_no)
            );
            CREATE TABLE IF NOT EXISTS message_delivery_status (
                message_id TEXT PRIMARY KEY,
                platform_message_id TEXT,
                status TEXT NOT NULL,
                error_message TEXT
            );
            CREATE TABLE IF NOT EXISTS credits (
                user_id TEXT PRIMARY KEY REFERENCES users(user_id),
                remaining_credits INTEGER NOT NULL,
                last_updated TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meetings (
                meeting_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(user_id),
                conversation_id TEXT NOT NULL,
                google_event_id TEXT NOT NULL,
                title TEXT NOT NULL,
                meeting_time TEXT NOT NULL,
                meet_link TEXT,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS google_calendar_tokens (
                user_id TEXT PRIMARY KEY REFERENCES users(user_id),
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                token_expiry TEXT NOT NULL,
                scope TEXT
            );
            "#,
        )
        .context("failed to initialize schema")?;
        Ok(())
    }

    // Minimal admin write surface, used by provisioning and tests.

    pub async fn insert_user(&self, user_id: &str, email: Option<&str>) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT OR IGNORE INTO users (user_id, email) VALUES (?1, ?2)",
                params![user_id, email],
            )?;
            Ok(())
        })
    }

    pub async fn insert_agent(
        &self,
        agent_id: &str,
        user_id: &str,
        prompt_id: &str,
        name: Option<&str>,
    ) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT OR REPLACE INTO agents (agent_id, user_id, prompt_id, name)
                 VALUES (?1, ?2, ?3, ?4)",
                params![agent_id, user_id, prompt_id, name],
            )?;
            Ok(())
        })
    }

    pub async fn insert_phone_number(
        &self,
        phone_number_id: &str,
        agent_id: Option<&str>,
        access_token: &str,
        meta_phone_number_id: &str,
        platform: Platform,
    ) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT OR REPLACE INTO phone_numbers
                 (phone_number_id, agent_id, access_token, meta_phone_number_id, platform)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    phone_number_id,
                    agent_id,
                    access_token,
                    meta_phone_number_id,
                    platform.as_str()
                ],
            )?;
            Ok(())
        })
    }

    pub async fn set_credits(&self, user_id: &str, remaining: i64) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT INTO credits (user_id, remaining_credits, last_updated)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                     remaining_credits = excluded.remaining_credits,
                     last_updated = excluded.last_updated",
                params![user_id, remaining, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            let mut stmt = c.prepare(
                "SELECT message_id, conversation_id, sender, text, status, sequence_no,
                        platform_message_id, timestamp
                 FROM messages WHERE conversation_id = ?1 ORDER BY sequence_no",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (message_id, conversation_id, sender, text, status, seq, pmid, ts) = row?;
                out.push(MessageRecord {
                    message_id,
                    conversation_id,
                    sender: Sender::from_str(&sender)?,
                    text,
                    status: MessageStatus::from_str(&status)?,
                    sequence_no: seq as u64,
                    platform_message_id: pmid,
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                });
            }
            Ok(out)
        })
    }
}

fn parse_platform(s: &str) -> Result<Platform> {
    match s {
        "whatsapp" => Ok(Platform::Whatsapp),
        "instagram" => Ok(Platform::Instagram),
        "webchat" => Ok(Platform::Webchat),
        _ => bail!("unknown platform: {}", s),
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn resolve_route(&self, phone_number_id: &str) -> Result<Option<AgentRoute>> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            let row = c
                .query_row(
                    "SELECT p.phone_number_id, a.user_id, a.agent_id, a.prompt_id,
                            p.access_token, p.meta_phone_number_id, p.platform
                     FROM phone_numbers p
                     JOIN agents a ON a.agent_id = p.agent_id
                     WHERE p.phone_number_id = ?1",
                    params![phone_number_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some((pnid, user_id, agent_id, prompt_id, token, meta_id, platform)) => {
                    Ok(Some(AgentRoute {
                        phone_number_id: pnid,
                        user_id,
                        agent_id,
                        prompt_id,
                        access_token: token,
                        meta_phone_number_id: meta_id,
                        platform: parse_platform(&platform)?,
                    }))
                }
                None => Ok(None),
            }
        })
    }

    async fn find_active_conversation(
        &self,
        agent_id: &str,
        customer_phone: &str,
    ) -> Result<Option<ConversationRow>> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            Ok(c.query_row(
                "SELECT conversation_id, agent_id, customer_phone, openai_conversation_id
                 FROM conversations
                 WHERE agent_id = ?1 AND customer_phone = ?2 AND is_active = 1",
                params![agent_id, customer_phone],
                |row| {
                    Ok(ConversationRow {
                        conversation_id: row.get(0)?,
                        agent_id: row.get(1)?,
                        customer_phone: row.get(2)?,
                        openai_conversation_id: row.get(3)?,
                    })
                },
            )
            .optional()?)
        })
    }

    async fn create_conversation(
        &self,
        agent_id: &str,
        customer_phone: &str,
    ) -> Result<ConversationRow> {
        let conversation_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT INTO conversations
                 (conversation_id, agent_id, customer_phone, created_at, last_message_at, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?4, 1)",
                params![conversation_id, agent_id, customer_phone, now],
            )?;
            Ok(())
        })?;
        Ok(ConversationRow {
            conversation_id,
            agent_id: agent_id.to_string(),
            customer_phone: customer_phone.to_string(),
            openai_conversation_id: None,
        })
    }

    async fn set_openai_conversation_id(
        &self,
        conversation_id: &str,
        openai_conversation_id: &str,
    ) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "UPDATE conversations SET openai_conversation_id = ?2
                 WHERE conversation_id = ?1 AND openai_conversation_id IS NULL",
                params![conversation_id, openai_conversation_id],
            )?;
            Ok(())
        })
    }

    async fn max_sequence_no(&self, conversation_id: &str) -> Result<u64> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            let max: i64 = c.query_row(
                "SELECT COALESCE(MAX(sequence_no), 0) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            Ok(max as u64)
        })
    }

    async fn remaining_credits(&self, user_id: &str) -> Result<Option<i64>> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            Ok(c.query_row(
                "SELECT remaining_credits FROM credits WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
        })
    }

    async fn deduct_credits(&self, user_id: &str, amount: i64) -> Result<Option<i64>> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            Ok(c.query_row(
                "UPDATE credits
                 SET remaining_credits = remaining_credits - ?2, last_updated = ?3
                 WHERE user_id = ?1 AND remaining_credits >= ?2
                 RETURNING remaining_credits",
                params![user_id, amount, Utc::now().to_rfc3339()],
                |row| row.get(0),
            )
            .optional()?)
        })
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT INTO messages
                 (message_id, conversation_id, sender, text, status, sequence_no,
                  platform_message_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.message_id,
                    record.conversation_id,
                    record.sender.as_str(),
                    record.text,
                    record.status.as_str(),
                    record.sequence_no as i64,
                    record.platform_message_id,
                    record.timestamp.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    async fn upsert_delivery_status(
        &self,
        message_id: &str,
        platform_message_id: Option<&str>,
        status: MessageStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT INTO message_delivery_status
                 (message_id, platform_message_id, status, error_message)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(message_id) DO UPDATE SET
                     platform_message_id = excluded.platform_message_id,
                     status = excluded.status,
                     error_message = excluded.error_message",
                params![message_id, platform_message_id, status.as_str(), error_message],
            )?;
            Ok(())
        })
    }

    async fn touch_conversation(&self, conversation_id: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "UPDATE conversations SET last_message_at = ?2 WHERE conversation_id = ?1",
                params![conversation_id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    async fn user_for_conversation(&self, conversation_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            Ok(c.query_row(
                "SELECT a.user_id
                 FROM conversations cv
                 JOIN agents a ON a.agent_id = cv.agent_id
                 WHERE cv.conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?)
        })
    }

    async fn calendar_tokens(&self, user_id: &str) -> Result<Option<CalendarTokens>> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            let row = c
                .query_row(
                    "SELECT access_token, refresh_token, token_expiry, scope
                     FROM google_calendar_tokens WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row.map(|(access_token, refresh_token, expiry, scope)| CalendarTokens {
                access_token,
                refresh_token,
                token_expiry: DateTime::parse_from_rfc3339(&expiry)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                scope,
            }))
        })
    }

    async fn store_calendar_tokens(&self, user_id: &str, tokens: &CalendarTokens) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT INTO google_calendar_tokens
                 (user_id, access_token, refresh_token, token_expiry, scope)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                     access_token = excluded.access_token,
                     refresh_token = excluded.refresh_token,
                     token_expiry = excluded.token_expiry,
                     scope = excluded.scope",
                params![
                    user_id,
                    tokens.access_token,
                    tokens.refresh_token,
                    tokens.token_expiry.to_rfc3339(),
                    tokens.scope
                ],
            )?;
            Ok(())
        })
    }

    async fn insert_meeting(&self, meeting: &MeetingRecord) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(|c| {
            c.execute(
                "INSERT INTO meetings
                 (meeting_id, user_id, conversation_id, google_event_id, title,
                  meeting_time, meet_link, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    meeting.meeting_id,
                    meeting.user_id,
                    meeting.conversation_id,
                    meeting.google_event_id,
                    meeting.title,
                    meeting.meeting_time,
                    meeting.meet_link,
                    meeting.status
                ],
            )?;
            Ok(())
        })
    }
}
