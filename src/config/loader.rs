//! Configuration loading.
//!
//! Reads and parses TOML configuration files into [`PeergateConfig`].

use std::fmt;
use std::path::Path;

use crate::config::schema::PeergateConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Errors that occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read from disk.
    Io(std::io::Error),
    /// The file contents are not valid TOML or do not match the schema.
    Parse(toml::de::Error),
    /// The parsed configuration failed semantic validation.
    Validation(Vec<ValidationError>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {e}"),
            ConfigError::Validation(errors) => {
                writeln!(f, "config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Loads, parses and validates a configuration file.
pub fn load_config(path: &Path) -> Result<PeergateConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: PeergateConfig = toml::from_str(&raw)?;
    let errors = validate_config(&config);
    if !errors.is_empty() {
        return Err(ConfigError::Validation(errors));
    }
    Ok(config)
}
