//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the node's
//! network core. All types derive Serde traits for deserialization from
//! config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the peergate network core.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PeergateConfig {
    /// Connection server settings (bind address, timeouts, session limits).
    pub server: ServerConfig,

    /// TLS bootstrap settings.
    pub tls: TlsConfig,

    /// Forwarding proxy settings.
    pub proxy: ProxyConfig,

    /// Per-host access tracking settings.
    pub tracker: TrackerConfig,

    /// Host/path blacklist entries.
    pub blacklist: BlacklistConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Connection server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address specification: `"port"`, `"ip:port"` or `"#iface:port"`.
    /// A `#`-prefixed interface name resolves to that interface's first
    /// IPv4 address.
    pub address: String,

    /// Socket read timeout in seconds.
    pub timeout_secs: u64,

    /// Idle window for persistent connections after the first command,
    /// in seconds.
    pub keep_alive_secs: u64,

    /// Ceiling on concurrently running sessions. Reaching it triggers
    /// pruning of old sessions rather than rejecting the new connection.
    pub max_busy_sessions: usize,

    /// Sessions older than this many seconds are eligible for pruning
    /// when the busy ceiling is reached.
    pub session_grace_secs: u64,

    /// Maximum accepted command line length in bytes.
    pub command_max_length: usize,

    /// Enable the deny-host / brute-force machinery.
    pub block_attack: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8090".to_string(),
            timeout_secs: 10,
            keep_alive_secs: 1800,
            max_busy_sessions: 100,
            session_grace_secs: 30,
            command_max_length: 8192,
            block_attack: true,
        }
    }
}

/// TLS bootstrap configuration.
///
/// When enabled without key material, a self-signed identity is generated
/// so TLS can still be offered without manual provisioning.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Offer TLS on the listening port (detected per connection).
    pub enabled: bool,

    /// Path to certificate chain file (PEM).
    pub cert_path: Option<String>,

    /// Path to private key file (PEM).
    pub key_path: Option<String>,

    /// Optional PEM identity bundle imported once at startup, then
    /// cleared from the in-memory configuration.
    pub import_path: Option<String>,
}

/// Forwarding proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Product token used in Via, Proxy-agent and the rewritten User-Agent.
    pub name: String,

    /// Append this hop to the Via header when forwarding.
    pub send_via_header: bool,

    /// Attach the client IP as X-Forwarded-For when forwarding.
    pub send_x_forwarded_for: bool,

    /// Registrable domains exempt from User-Agent rewriting.
    pub yellow_list: Vec<String>,

    /// Optional upstream proxy-of-proxies.
    pub remote_proxy: RemoteProxyConfig,

    /// Path to an external line-oriented redirector executable.
    /// Empty disables the redirector.
    pub redirector_path: String,

    /// Base64 credential (`base64(user:password)`) required in the
    /// Authorization header for proxy use. Empty disables the check.
    pub admin_account_b64: String,

    /// Store cacheable fetched content in the cache.
    pub cache_enabled: bool,

    /// Largest body captured into the in-memory cache side buffer.
    pub max_cache_body_bytes: usize,

    /// Largest request body accepted for forwarding. Claims above this
    /// are rejected before any buffering.
    pub max_post_body_bytes: usize,

    /// Content types considered indexable. Indexable content is stored
    /// even when `cache_enabled` is false.
    pub indexable_types: Vec<String>,

    /// Origin request timeout in seconds.
    pub fetch_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: "peergate".to_string(),
            send_via_header: true,
            send_x_forwarded_for: true,
            yellow_list: Vec::new(),
            remote_proxy: RemoteProxyConfig::default(),
            redirector_path: String::new(),
            admin_account_b64: String::new(),
            cache_enabled: true,
            max_cache_body_bytes: 1024 * 1024,
            max_post_body_bytes: 8 * 1024 * 1024,
            indexable_types: vec!["text/html".to_string(), "text/plain".to_string()],
            fetch_timeout_secs: 30,
        }
    }
}

/// Upstream proxy-of-proxies configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteProxyConfig {
    /// Route origin fetches through the upstream proxy.
    pub enabled: bool,

    /// Upstream proxy host.
    pub host: String,

    /// Upstream proxy port.
    pub port: u16,

    /// Also tunnel CONNECT traffic through the upstream proxy.
    pub use_for_ssl: bool,
}

impl Default for RemoteProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 3128,
            use_for_ssl: true,
        }
    }
}

/// Access tracking configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Entries older than this many seconds are evicted.
    pub max_tracking_time_secs: u64,

    /// Per-host entry cap, enforced by the periodic sweep.
    pub max_tracking_count: usize,

    /// Global cap on tracked hosts.
    pub max_host_count: usize,

    /// Minimum interval between global sweeps, in seconds.
    pub cleanup_cycle_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_tracking_time_secs: 3600,
            max_tracking_count: 1000,
            max_host_count: 100,
            cleanup_cycle_secs: 60,
        }
    }
}

/// Blacklist configuration. Matching hosts receive a 403 with no origin
/// contact and no cache lookup.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Hosts blocked for any path.
    pub hosts: Vec<String>,

    /// `host/path-prefix` entries blocked for matching paths only.
    pub patterns: Vec<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Emit the squid-style proxy access log.
    pub access_log: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            access_log: true,
        }
    }
}
