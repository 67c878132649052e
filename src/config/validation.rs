//! Semantic validation of parsed configuration.

use std::fmt;

use crate::config::schema::PeergateConfig;

/// A single validation failure, with the offending field path.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn err(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validates the full configuration, collecting all failures rather than
/// stopping at the first.
pub fn validate_config(config: &PeergateConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.server.address.is_empty() {
        errors.push(err("server.address", "must not be empty"));
    }
    if config.server.timeout_secs == 0 {
        errors.push(err("server.timeout_secs", "must be greater than zero"));
    }
    if config.server.keep_alive_secs == 0 {
        errors.push(err("server.keep_alive_secs", "must be greater than zero"));
    }
    if config.server.max_busy_sessions == 0 {
        errors.push(err("server.max_busy_sessions", "must be greater than zero"));
    }
    if config.server.command_max_length < 64 {
        errors.push(err("server.command_max_length", "must be at least 64"));
    }

    if config.tls.enabled {
        match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(_), None) => {
                errors.push(err("tls.key_path", "required when cert_path is set"))
            }
            (None, Some(_)) => {
                errors.push(err("tls.cert_path", "required when key_path is set"))
            }
            _ => {}
        }
    }

    if config.proxy.name.is_empty() {
        errors.push(err("proxy.name", "must not be empty"));
    }
    if config.proxy.fetch_timeout_secs == 0 {
        errors.push(err("proxy.fetch_timeout_secs", "must be greater than zero"));
    }
    if config.proxy.max_cache_body_bytes == 0 {
        errors.push(err(
            "proxy.max_cache_body_bytes",
            "must be greater than zero",
        ));
    }
    if config.proxy.max_post_body_bytes == 0 {
        errors.push(err(
            "proxy.max_post_body_bytes",
            "must be greater than zero",
        ));
    }
    if config.proxy.remote_proxy.enabled {
        if config.proxy.remote_proxy.host.is_empty() {
            errors.push(err("proxy.remote_proxy.host", "required when enabled"));
        }
        if config.proxy.remote_proxy.port == 0 {
            errors.push(err("proxy.remote_proxy.port", "must be non-zero"));
        }
    }

    if config.tracker.max_host_count == 0 {
        errors.push(err("tracker.max_host_count", "must be greater than zero"));
    }
    if config.tracker.max_tracking_count == 0 {
        errors.push(err(
            "tracker.max_tracking_count",
            "must be greater than zero",
        ));
    }

    for pattern in &config.blacklist.patterns {
        if !pattern.contains('/') {
            errors.push(err(
                "blacklist.patterns",
                format!("'{pattern}' must be host/path-prefix"),
            ));
        }
    }

    let level = config.observability.log_level.as_str();
    if !matches!(level, "trace" | "debug" | "info" | "warn" | "error") {
        errors.push(err(
            "observability.log_level",
            format!("unknown level '{level}'"),
        ));
    }

    errors
}
