//! Client configuration.
//!
//! Loaded from `<config_dir>/ingest/config.toml` when present, then
//! overridden by `INGEST_URL` / `INGEST_TIMEOUT_SECS`, then by CLI flags.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default content chunk size (256KB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Default capacity of in-memory channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

pub const ENV_URL: &str = "INGEST_URL";
pub const ENV_TIMEOUT_SECS: &str = "INGEST_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Service endpoint (`host:port` or `tcp://host:port`)
    pub url: Option<String>,

    /// Deadline for a whole add operation
    pub timeout_secs: Option<u64>,

    /// Size of content chunks read from local files
    pub chunk_size: usize,

    /// Bounded capacity of in-memory duplex channels
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Default config file location (~/.config/ingest/config.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ingest").join("config.toml"))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Load the given file, or the default file if it exists, or defaults.
    /// Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var(ENV_URL) {
            if !url.is_empty() {
                self.url = Some(url);
            }
        }
        if let Ok(secs) = std::env::var(ENV_TIMEOUT_SECS) {
            let secs = secs.trim().parse::<u64>().map_err(|_| {
                IngestError::Config(format!("{} must be an integer, got {:?}", ENV_TIMEOUT_SECS, secs))
            })?;
            self.timeout_secs = Some(secs);
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(IngestError::Config("chunk_size must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(IngestError::Config("channel_capacity must be positive".into()));
        }
        Ok(())
    }
}
