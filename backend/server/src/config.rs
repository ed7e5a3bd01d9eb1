use std::{env, fmt::Display, fs::read_to_string, str::FromStr};

use thiserror::Error;
use tracing::{info, warn};

const SECRETS_DIR: &str = "/run/secrets";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value: {message}")]
    Invalid { key: String, message: String },

    #[error("Unknown store backend: {0}")]
    UnknownBackend(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Redis,
    Memory,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(Backend::Redis),
            "memory" => Ok(Backend::Memory),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Redis => f.write_str("redis"),
            Backend::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub backend: Backend,
    pub redis_url: String,
    pub blob_url: String,
    pub blob_public_url: String,
    pub blob_token: Option<String>,
    pub identity_url: String,
    pub max_upload_bytes: usize,
    pub long_poll_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            port: try_load("RUST_PORT", "8080")?,
            backend: try_load("STORE_BACKEND", "redis")?,
            redis_url: try_load("REDIS_URL", "redis://redis:6379")?,
            blob_url: try_load("BLOB_URL", "http://blobs:9000/duespoll")?,
            blob_public_url: try_load("BLOB_PUBLIC_URL", "http://localhost:9000/duespoll")?,
            blob_token: read_secret("BLOB_TOKEN"),
            identity_url: try_load("IDENTITY_URL", "http://identity:9099")?,
            max_upload_bytes: try_load("MAX_UPLOAD_BYTES", "5242880")?,
            long_poll_secs: try_load("LONG_POLL_SECS", "25")?,
        })
    }

    /// Settings for running everything in process, without Redis or HTTP services.
    pub fn in_memory() -> Self {
        Self {
            port: 0,
            backend: Backend::Memory,
            redis_url: String::new(),
            blob_url: String::new(),
            blob_public_url: "memory://blobs".to_string(),
            blob_token: None,
            identity_url: String::new(),
            max_upload_bytes: 5 * 1024 * 1024,
            long_poll_secs: 25,
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            }
        })
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("{SECRETS_DIR}/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            warn!("Failed to read {secret_name} from file: {e}");
        })
        .ok()
}
