pub mod actions;
pub mod config;
pub mod credits;
pub mod db;
pub mod llm;
pub mod persistence;
pub mod platform;
pub mod session;
pub mod storage;
pub mod utils;
pub mod worker;

pub use actions::{detect_meeting_action, MeetingBooker, MeetingScheduler};
pub use config::Config;
pub use credits::CreditLedger;
pub use db::{Database, SqliteDatabase};
pub use llm::{LlmClient, LlmService};
pub use persistence::PersistenceExecutor;
pub use platform::{LiveSessionHub, MessageSender, PlatformClient};
pub use session::SessionCache;
pub use storage::{GatewayStore, MemoryStore, Platform, QueuedMessage};
pub use utils::errors::GatewayError;
pub use utils::{setup_logging, HealthServer, Metrics};
pub use worker::{WorkerContext, WorkerManager};
