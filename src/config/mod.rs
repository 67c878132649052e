//! Configuration management: schema, loading and validation.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BlacklistConfig, ObservabilityConfig, PeergateConfig, ProxyConfig, RemoteProxyConfig,
    ServerConfig, TlsConfig, TrackerConfig,
};
pub use validation::{validate_config, ValidationError};
