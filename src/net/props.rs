//! Per-exchange connection properties.
//!
//! One value of [`ConnectionProperties`] accompanies each command through
//! parsing, handling and access logging. It replaces loose key/value
//! passing with named, typed fields.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::proxy::outcome::OutcomeCode;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Properties of a single request/response exchange on a session.
#[derive(Debug, Clone)]
pub struct ConnectionProperties {
    /// Request method token, upper case.
    pub method: String,
    /// Full requested URL, or `host:port` for tunnel requests.
    pub url: String,
    /// Request path component.
    pub path: String,
    /// Raw query string, if any.
    pub args: Option<String>,
    /// HTTP version token from the request line, e.g. `HTTP/1.1`.
    pub http_version: String,
    /// Client address, with loopback normalized to `localhost`.
    pub client_ip: String,
    /// Destination host.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Response media type, empty when unknown.
    pub mime: String,
    /// Status code sent to the client.
    pub status: u16,
    /// Bytes written to the client for this exchange.
    pub response_size: u64,
    /// Cache outcome, set once the serving path is decided.
    pub outcome: Option<OutcomeCode>,
    /// Whether the connection stays open after this exchange.
    pub persistent: bool,
    /// Whether response headers have already been written. Once set, error
    /// pages can no longer be sent.
    pub headers_sent: bool,
    /// Exchange start, ms since epoch.
    pub request_start_ms: u64,
    /// Exchange end, ms since epoch. Zero until finished.
    pub request_end_ms: u64,
}

impl ConnectionProperties {
    pub fn new(client_ip: String) -> Self {
        Self {
            method: String::new(),
            url: String::new(),
            path: String::new(),
            args: None,
            http_version: "HTTP/0.9".to_string(),
            client_ip,
            host: String::new(),
            port: 80,
            mime: String::new(),
            status: 0,
            response_size: 0,
            outcome: None,
            persistent: false,
            headers_sent: false,
            request_start_ms: now_millis(),
            request_end_ms: 0,
        }
    }

    /// Marks the exchange finished for elapsed-time accounting.
    pub fn finish(&mut self) {
        self.request_end_ms = now_millis();
    }
}
