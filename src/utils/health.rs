use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::utils::metrics::Metrics;
use crate::worker::WorkerManager;

/// Health check and metrics HTTP server.
pub struct HealthServer {
    manager: Arc<WorkerManager>,
    metrics: Arc<Metrics>,
    port: u16,
}

impl HealthServer {
    pub fn new(manager: Arc<WorkerManager>, metrics: Arc<Metrics>, port: u16) -> Self {
        Self {
            manager,
            metrics,
            port,
        }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        info!("starting health server on port {}", self.port);

        let manager = self.manager.clone();
        let health = warp::path("health").and(warp::get()).and_then(move || {
            let manager = manager.clone();
            async move { handle_health(manager).await }
        });

        let metrics_handle = self.metrics.clone();
        let metrics = warp::path("metrics").and(warp::get()).and_then(move || {
            let metrics = metrics_handle.clone();
            async move { handle_metrics(metrics).await }
        });

        let ready = warp::path("ready")
            .and(warp::get())
            .map(|| warp::reply::with_status("OK", StatusCode::OK));

        let live = warp::path("live")
            .and(warp::get())
            .map(|| warp::reply::with_status("OK", StatusCode::OK));

        let routes = health.or(metrics).or(ready).or(live);

        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
        Ok(())
    }
}

async fn handle_health(manager: Arc<WorkerManager>) -> Result<impl Reply, Rejection> {
    let health = manager.health().await;
    let degraded = health.worker_count == 0;
    let status_code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "status": if degraded { "unhealthy" } else { "healthy" },
        "timestamp": chrono::Utc::now(),
        "worker_count": health.worker_count,
        "queue": health.queue,
        "workers": health.workers,
    });
    Ok(warp::reply::with_status(warp::reply::json(&body), status_code))
}

async fn handle_metrics(metrics: Arc<Metrics>) -> Result<impl Reply, Rejection> {
    match metrics.export() {
        Ok(exported) => Ok(warp::reply::with_header(
            exported,
            "content-type",
            "text/plain; version=0.0.4; charset=utf-8",
        )),
        Err(e) => {
            error!("failed to export metrics: {}", e);
            Ok(warp::reply::with_header(
                format!("# error exporting metrics: {}", e),
                "content-type",
                "text/plain; charset=utf-8",
            ))
        }
    }
}
