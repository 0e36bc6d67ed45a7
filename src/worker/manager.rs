use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::worker::{Worker, WorkerContext, WorkerHealth, WorkerStats};
use crate::storage::QueueStats;

/// Restart a worker whose windowed success rate drops below this.
const RESTART_SUCCESS_RATE: f64 = 0.5;
/// Scale down only while CPU sits below this.
const SCALE_DOWN_CPU: f32 = 30.0;

#[derive(Debug, Clone)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: u64,
    pub scale_down_threshold: u64,
    pub cpu_threshold: f32,
    pub check_interval: Duration,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_workers: 2,
            max_workers: 20,
            scale_up_threshold: 50,
            scale_down_threshold: 10,
            cpu_threshold: 80.0,
            check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Workers started up front; the scaler moves between min and max.
    pub initial_workers: usize,
    pub scaling: AutoScalingConfig,
    pub drain_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            initial_workers: 10,
            scaling: AutoScalingConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    Up,
    Down,
    Hold,
}

/// Pure scaling rule, kept separate so it can be reasoned about (and
/// tested) without a live queue.
pub fn scale_decision(
    queued: u64,
    cpu_percent: f32,
    current_workers: usize,
    config: &AutoScalingConfig,
) -> ScaleAction {
    if !config.enabled {
        return ScaleAction::Hold;
    }
    if (queued > config.scale_up_threshold || cpu_percent > config.cpu_threshold)
        && current_workers < config.max_workers
    {
        return ScaleAction::Up;
    }
    if queued < config.scale_down_threshold
        && cpu_percent < SCALE_DOWN_CPU
        && current_workers > config.min_workers
    {
        return ScaleAction::Down;
    }
    ScaleAction::Hold
}

struct WorkerHandle {
    id: String,
    wake: Arc<tokio::sync::Notify>,
    active: Arc<std::sync::atomic::AtomicBool>,
    stats: Arc<WorkerStats>,
    join: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerHealth {
    pub worker_count: usize,
    pub queue: QueueStats,
    pub workers: Vec<WorkerHealth>,
}

/// Supervises the worker fleet: event-driven dispatch off the store's
/// message-available signal, periodic auto-scaling on queue depth and CPU
/// load, unhealthy-worker restarts, and graceful drain on shutdown.
pub struct WorkerManager {
    ctx: Arc<WorkerContext>,
    config: ManagerConfig,
    workers: RwLock<Vec<WorkerHandle>>,
    dispatch_cursor: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    system: Mutex<System>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerManager {
    pub fn new(ctx: Arc<WorkerContext>, config: ManagerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            config,
            workers: RwLock::new(Vec::new()),
            dispatch_cursor: AtomicUsize::new(0),
            shutdown_tx,
            system: Mutex::new(System::new()),
            background: Mutex::new(Vec::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let initial = self
            .config
            .initial_workers
            .clamp(self.config.scaling.min_workers, self.config.scaling.max_workers);
        for _ in 0..initial {
            self.spawn_worker().await;
        }
        info!(workers = initial, "worker manager started");

        // Subscribe before returning so no enqueue can slip past the
        // dispatcher while it spins up.
        let events = self.ctx.store.message_events();
        let dispatcher = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.dispatch_loop(events).await })
        };
        let scaler = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.scaling_loop().await })
        };
        let mut background = self.background.lock().await;
        background.push(dispatcher);
        background.push(scaler);
    }

    async fn spawn_worker(self: &Arc<Self>) {
        let worker = Worker::new(self.ctx.clone(), self.shutdown_tx.subscribe());
        let handle = WorkerHandle {
            id: worker.id.clone(),
            wake: worker.wake.clone(),
            active: worker.active.clone(),
            stats: worker.stats.clone(),
            join: tokio::spawn(worker.run()),
        };
        debug!(worker_id = %handle.id, "worker spawned");
        self.workers.write().await.push(handle);
    }

    /// Wake exactly one worker per message-available event. A busy worker
    /// holds the permit and re-drains after its current message, so no
    /// event strands a message.
    async fn dispatch_loop(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<String>,
    ) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(_phone) => self.wake_one().await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatch lagged behind enqueue burst, waking all workers");
                        self.wake_all().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("dispatch loop stopped");
    }

    async fn wake_one(&self) {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return;
        }
        let idx = self.dispatch_cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
        workers[idx].wake.notify_one();
    }

    async fn wake_all(&self) {
        for worker in self.workers.read().await.iter() {
            worker.wake.notify_one();
        }
    }

    async fn scaling_loop(self: Arc<Self>) {
        let mut tick = interval(self.config.scaling.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.evaluate().await {
                error!(error = %e, "auto-scaler evaluation failed");
            }
        }
        debug!("scaling loop stopped");
    }

    /// One scaler pass: reap finished workers, restart unhealthy ones,
    /// then apply the scaling rule.
    async fn evaluate(self: &Arc<Self>) -> anyhow::Result<()> {
        let stats = self.ctx.store.queue_stats().await?;
        self.ctx.metrics.queue_depth.set(stats.queued as i64);
        if stats.queued > 0 {
            // Backlog with idle workers means a wakeup was lost somewhere;
            // the tick re-drains it.
            self.wake_all().await;
        }

        let cpu = {
            let mut system = self.system.lock().await;
            system.refresh_cpu_usage();
            system.global_cpu_info().cpu_usage()
        };

        self.reap_finished().await;
        self.restart_unhealthy().await;

        let current = self.workers.read().await.len();
        match scale_decision(stats.queued, cpu, current, &self.config.scaling) {
            ScaleAction::Up => {
                info!(
                    queued = stats.queued,
                    cpu_percent = cpu,
                    workers = current,
                    "scaling up"
                );
                self.spawn_worker().await;
            }
            ScaleAction::Down => {
                info!(queued = stats.queued, workers = current, "scaling down");
                self.retire_one().await;
            }
            ScaleAction::Hold => {}
        }
        Ok(())
    }

    async fn reap_finished(&self) {
        let mut workers = self.workers.write().await;
        workers.retain(|w| !w.join.is_finished());
    }

    async fn restart_unhealthy(self: &Arc<Self>) {
        let unhealthy: Vec<String> = {
            let workers = self.workers.read().await;
            let mut out = Vec::new();
            for worker in workers.iter() {
                if worker.stats.success_rate().await < RESTART_SUCCESS_RATE {
                    out.push(worker.id.clone());
                }
            }
            out
        };
        for worker_id in unhealthy {
            warn!(worker_id = %worker_id, "restarting unhealthy worker");
            {
                let mut workers = self.workers.write().await;
                if let Some(pos) = workers.iter().position(|w| w.id == worker_id) {
                    let handle = workers.remove(pos);
                    handle.active.store(false, Ordering::Relaxed);
                    handle.wake.notify_one();
                }
            }
            self.spawn_worker().await;
        }
    }

    /// Ask the newest worker to finish its current message and exit.
    async fn retire_one(&self) {
        let mut workers = self.workers.write().await;
        if let Some(handle) = workers.pop() {
            handle.active.store(false, Ordering::Relaxed);
            handle.wake.notify_one();
            debug!(worker_id = %handle.id, "worker retired");
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn health(&self) -> ManagerHealth {
        let queue = self.ctx.store.queue_stats().await.unwrap_or_default();
        let workers = self.workers.read().await;
        let mut snapshots = Vec::with_capacity(workers.len());
        for worker in workers.iter() {
            snapshots.push(worker.stats.snapshot(&worker.id).await);
        }
        ManagerHealth {
            worker_count: workers.len(),
            queue,
            workers: snapshots,
        }
    }

    /// Stop accepting new dequeues, await in-flight completions, abort the
    /// rest when the drain timeout passes.
    pub async fn shutdown(&self) {
        info!("worker manager shutting down");
        let _ = self.shutdown_tx.send(true);
        self.wake_all().await;

        for task in self.background.lock().await.drain(..) {
            task.abort();
        }

        let handles: Vec<WorkerHandle> = self.workers.write().await.drain(..).collect();
        let drain = async {
            for handle in &handles {
                while !handle.join.is_finished() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        };
        if tokio::time::timeout(self.config.drain_timeout, drain)
            .await
            .is_err()
        {
            warn!("drain timeout reached, aborting remaining workers");
            for handle in &handles {
                handle.join.abort();
            }
        }
        info!("worker manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutoScalingConfig {
        AutoScalingConfig::default()
    }

    #[test]
    fn scales_up_on_deep_queue() {
        assert_eq!(scale_decision(51, 10.0, 5, &config()), ScaleAction::Up);
    }

    #[test]
    fn scales_up_on_cpu_pressure() {
        assert_eq!(scale_decision(0, 85.0, 5, &config()), ScaleAction::Up);
    }

    #[test]
    fn respects_max_workers() {
        assert_eq!(scale_decision(500, 95.0, 20, &config()), ScaleAction::Hold);
    }

    #[test]
    fn scales_down_when_quiet() {
        assert_eq!(scale_decision(2, 10.0, 5, &config()), ScaleAction::Down);
    }

    #[test]
    fn holds_when_queue_is_low_but_cpu_busy() {
        assert_eq!(scale_decision(2, 50.0, 5, &config()), ScaleAction::Hold);
    }

    #[test]
    fn respects_min_workers() {
        assert_eq!(scale_decision(0, 1.0, 2, &config()), ScaleAction::Hold);
    }

    #[test]
    fn disabled_scaler_never_moves() {
        let mut cfg = config();
        cfg.enabled = false;
        assert_eq!(scale_decision(500, 95.0, 5, &cfg), ScaleAction::Hold);
    }

    #[test]
    fn mid_range_queue_holds() {
        assert_eq!(scale_decision(30, 50.0, 5, &config()), ScaleAction::Hold);
    }
}
