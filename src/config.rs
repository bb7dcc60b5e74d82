use std::env;

use thiserror::Error;

const MANAGER_HOST: &str = "MANAGER_HOST";
const MANAGER_PORT: &str = "MANAGER_PORT";
const WORKER_HOST: &str = "WORKER_HOST";
const WORKER_PORT: &str = "WORKER_PORT";

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_MANAGER_PORT: u16 = 5555;
const DEFAULT_WORKER_PORT: u16 = 5556;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: expected a port number")]
    InvalidPort { var: &'static str, value: String },
}

/// Listen address for the manager's control API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
}

/// Base listen address for workers. A multi-worker launch binds consecutive
/// ports starting at `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(ManagerConfig {
            host: lookup(MANAGER_HOST).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_port(MANAGER_PORT, lookup(MANAGER_PORT), DEFAULT_MANAGER_PORT)?,
        })
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(WorkerConfig {
            host: lookup(WORKER_HOST).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_port(WORKER_PORT, lookup(WORKER_PORT), DEFAULT_WORKER_PORT)?,
        })
    }
}

fn parse_port(
    var: &'static str,
    value: Option<String>,
    default: u16,
) -> Result<u16, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidPort { var, value: raw }),
    }
}
