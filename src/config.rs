// src/config.rs
use crate::leaf_model::DEFAULT_TOP_K;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_MODEL_DIR: &str = "model";
pub const DEFAULT_LISTEN_ADDR: &str = "[::1]:50051";
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-level settings, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub model_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub default_top_k: usize,
    pub max_image_bytes: usize,
    pub intra_threads: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source, defaulting unset
    /// variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let model_dir = lookup("MODEL_DIR").unwrap_or_else(|| DEFAULT_MODEL_DIR.to_string());
        let listen_addr = lookup("LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                name: "LISTEN_ADDR",
                value: listen_addr.clone(),
                reason: e.to_string(),
            })?;

        let default_top_k = parse_positive(&lookup, "TOP_K", DEFAULT_TOP_K)?;
        let max_image_bytes = parse_positive(&lookup, "MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES)?;
        let intra_threads = parse_positive(&lookup, "INTRA_THREADS", num_cpus::get())?;

        Ok(Self {
            model_dir: PathBuf::from(model_dir),
            listen_addr,
            default_top_k,
            max_image_bytes,
            intra_threads,
        })
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    let parsed = value.trim().parse::<usize>();
    match parsed {
        Ok(0) => Err(ConfigError::InvalidValue {
            name,
            value,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(count) => Ok(count),
        Err(e) => Err(ConfigError::InvalidValue {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}
