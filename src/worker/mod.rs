pub mod manager;
pub mod worker;

pub use manager::{
    scale_decision, AutoScalingConfig, ManagerConfig, ManagerHealth, ScaleAction, WorkerManager,
};
pub use worker::{
    LeaseDisposition, ProcessResult, RateLimitRetrySettings, Worker, WorkerContext,
    WorkerHealth, WorkerSettings, WorkerStats,
};
