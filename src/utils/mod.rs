pub mod errors;
pub mod health;
pub mod logger;
pub mod metrics;

pub use errors::GatewayError;
pub use health::HealthServer;
pub use logger::setup_logging;
pub use metrics::Metrics;
