pub mod health;
pub mod metrics;

pub use health::{BridgeStatus, health_endpoint};
pub use metrics::{ScopedTimer, global_metrics, metrics_endpoint};
