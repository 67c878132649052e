//! Structured logging and the proxy access log.
//!
//! Diagnostic logging goes through `tracing` with env-filter overrides.
//! Completed proxy exchanges additionally emit one squid-style line on the
//! dedicated `proxy_access` target:
//!
//! `seconds.millis elapsed clientIP OUTCOME/status bytes METHOD url - DIRECT/host mime`

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::net::props::ConnectionProperties;

/// Initializes the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Formats one access log line for a finished exchange.
pub fn format_access_line(props: &ConnectionProperties) -> String {
    let elapsed = props.request_end_ms.saturating_sub(props.request_start_ms);
    let outcome = props
        .outcome
        .map(|o| o.as_str())
        .unwrap_or("MISS");
    let mime = if props.mime.is_empty() { "-" } else { &props.mime };
    format!(
        "{}.{:03} {:>6} {} {}/{} {} {} {} - DIRECT/{} {}",
        props.request_end_ms / 1000,
        props.request_end_ms % 1000,
        elapsed,
        props.client_ip,
        outcome,
        props.status,
        props.response_size,
        props.method,
        props.url,
        props.host,
        mime,
    )
}

/// Emits the access log line on the `proxy_access` target.
pub fn log_proxy_access(props: &ConnectionProperties) {
    tracing::info!(target: "proxy_access", "{}", format_access_line(props));
}
