use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod actions;
mod config;
mod credits;
mod db;
mod llm;
mod persistence;
mod platform;
mod session;
mod storage;
mod utils;
mod worker;

use actions::MeetingBooker;
use config::Config;
use credits::CreditLedger;
use db::SqliteDatabase;
use llm::LlmClient;
use persistence::PersistenceExecutor;
use platform::{LiveSessionHub, PlatformClient};
use session::SessionCache;
use storage::{redis::RedisStore, GatewayStore, MemoryStore};
use utils::{HealthServer, Metrics};
use worker::{WorkerContext, WorkerManager};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory") {
            eprintln!("failed to load .env file: {}", e);
        }
    }

    utils::setup_logging()?;
    info!("starting chatgate v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("configuration loaded");

    let metrics = Arc::new(Metrics::new()?);

    let store: Arc<dyn GatewayStore> = match config.storage.backend.as_str() {
        "redis" => {
            let store = RedisStore::connect(config.redis_store_config()).await?;
            store.start_janitor();
            store
        }
        _ => {
            let store = MemoryStore::new(config.memory_store_config());
            store.start_janitor();
            store
        }
    };
    info!(backend = %config.storage.backend, "storage ready");

    let database = Arc::new(SqliteDatabase::open(&db::DatabaseConfig {
        path: config.database.path.clone(),
        max_connections: config.database.max_connections,
    })?);

    let sessions = Arc::new(SessionCache::new(store.clone(), database.clone()));
    let credits = Arc::new(CreditLedger::new(store.clone(), database.clone()));
    let persistence = Arc::new(PersistenceExecutor::new(database.clone(), credits.clone()));

    let llm = Arc::new(LlmClient::new(config.llm_client_config())?);
    match llm.connection_test().await {
        Ok(latency) => info!(latency_ms = latency.as_millis() as u64, "llm reachable"),
        Err(e) => warn!(error = %e, "llm connection test failed, continuing"),
    }

    let sender = Arc::new(PlatformClient::new(config.platform_client_config())?);
    let scheduler = Arc::new(MeetingBooker::new(
        database.clone(),
        config.booking_config(),
    )?);
    let live = Arc::new(LiveSessionHub::new());

    let ctx = Arc::new(WorkerContext {
        store,
        sessions,
        credits,
        llm,
        sender,
        scheduler,
        persistence,
        live,
        metrics: metrics.clone(),
        settings: config.worker_settings(),
    });

    let manager = WorkerManager::new(ctx, config.manager_config());
    manager.start().await;

    if config.monitoring.enable_metrics_server {
        let health = HealthServer::new(
            manager.clone(),
            metrics,
            config.monitoring.health_check_port,
        );
        tokio::spawn(async move {
            if let Err(e) = health.start().await {
                error!(error = %e, "health server failed");
            }
        });
        info!(
            port = config.monitoring.health_check_port,
            "health server started"
        );
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining workers");
    manager.shutdown().await;
    info!("chatgate stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).expect("sigterm handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
