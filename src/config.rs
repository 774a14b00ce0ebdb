//! Configuration management for tasklink.
//!
//! Configuration can be set via environment variables:
//! - `TASKLINK_HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `TASKLINK_PORT` - Optional. Server port. Defaults to `3100`.
//! - `TASKLINK_STORE` - Optional. `memory` or `sqlite`. Defaults to `sqlite`.
//! - `TASKLINK_DATA_DIR` - Optional. Directory holding the SQLite database. Defaults to `./.tasklink`.
//! - `TASKLINK_EVENT_CAPACITY` - Optional. Buffered events per subscriber. Defaults to `1024`.

use std::path::PathBuf;
use thiserror::Error;

use crate::store::TaskStoreType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub store_type: TaskStoreType,
    /// Directory for persistent stores.
    pub data_dir: PathBuf,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
            store_type: TaskStoreType::default(),
            data_dir: PathBuf::from(".tasklink"),
            event_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = std::env::var("TASKLINK_HOST").unwrap_or(defaults.host);

        let port = match std::env::var("TASKLINK_PORT") {
            Ok(raw) => raw.parse().map_err(|e| {
                ConfigError::InvalidValue("TASKLINK_PORT".to_string(), format!("{}", e))
            })?,
            Err(_) => defaults.port,
        };

        let store_type = std::env::var("TASKLINK_STORE")
            .map(|v| TaskStoreType::from_str(&v))
            .unwrap_or(defaults.store_type);

        let data_dir = std::env::var("TASKLINK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let event_capacity = match std::env::var("TASKLINK_EVENT_CAPACITY") {
            Ok(raw) => parse_capacity(&raw)?,
            Err(_) => defaults.event_capacity,
        };

        Ok(Self {
            host,
            port,
            store_type,
            data_dir,
            event_capacity,
        })
    }

    /// Configuration for tests: in-memory store, ephemeral port.
    pub fn in_memory() -> Self {
        Self {
            port: 0,
            store_type: TaskStoreType::Memory,
            ..Self::default()
        }
    }
}

fn parse_capacity(raw: &str) -> Result<usize, ConfigError> {
    let value: usize = raw.parse().map_err(|e| {
        ConfigError::InvalidValue("TASKLINK_EVENT_CAPACITY".to_string(), format!("{}", e))
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            "TASKLINK_EVENT_CAPACITY".to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 3100);
        assert_eq!(config.store_type, TaskStoreType::Sqlite);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_capacity_must_be_positive() {
        assert!(parse_capacity("0").is_err());
        assert!(parse_capacity("lots").is_err());
        assert_eq!(parse_capacity("8").unwrap(), 8);
    }
}
