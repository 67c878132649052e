//! Observability: structured logging, proxy access log and metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_proxy_access};
