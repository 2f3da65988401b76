//! Client configuration.
//!
//! A [`ClientConfig`] names the filesystem to connect to and the defaults
//! applied to files opened through the resulting handle. It loads from JSON
//! and can be overridden from `OXDFS_*` environment variables:
//!
//! | variable | field |
//! |---|---|
//! | `OXDFS_HOST` | `host` |
//! | `OXDFS_PORT` | `port` |
//! | `OXDFS_USER` | `user` |
//! | `OXDFS_BUFFER_SIZE` | `buffer_size` |
//! | `OXDFS_REPLICATION` | `replication` |
//! | `OXDFS_BLOCK_SIZE` | `block_size` |
//! | `OXDFS_COPY_BUFFER_SIZE` | `copy_buffer_size` |

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::client::{DEFAULT_COPY_BUFFER_SIZE, FilesystemHandle};
use crate::error::DfsError;
use crate::session::SessionRegistry;
use crate::transport::{OpenHints, Transport};

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value {value:?} for {variable}")]
    InvalidVariable { variable: &'static str, value: String },
}

/// Connection target and per-file defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `""` for the local filesystem, `"default"` (with port 0) for the
    /// transport's default filesystem, otherwise a namenode host
    pub host: String,
    pub port: u16,
    /// Empty for the ambient identity
    pub user: String,
    /// Stream buffer hint, 0 for the cluster default
    pub buffer_size: u32,
    /// Replication hint for new files, 0 for the cluster default
    pub replication: u16,
    /// Block size hint for new files, 0 for the cluster default
    pub block_size: u64,
    /// Chunk size for copies between different transports, clamped to
    /// `1..=MAX_COPY_BUFFER_SIZE` on connect
    pub copy_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "default".to_string(),
            port: 0,
            user: String::new(),
            buffer_size: 0,
            replication: 0,
            block_size: 0,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&content)?;
        debug!(path = %path.as_ref().display(), "Loaded client config");
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Override fields from `lookup`, which maps a variable name to its
    /// value. Unset variables leave their field alone.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("OXDFS_HOST") {
            self.host = host;
        }
        if let Some(user) = lookup("OXDFS_USER") {
            self.user = user;
        }
        override_parsed(&lookup, "OXDFS_PORT", &mut self.port)?;
        override_parsed(&lookup, "OXDFS_BUFFER_SIZE", &mut self.buffer_size)?;
        override_parsed(&lookup, "OXDFS_REPLICATION", &mut self.replication)?;
        override_parsed(&lookup, "OXDFS_BLOCK_SIZE", &mut self.block_size)?;
        override_parsed(&lookup, "OXDFS_COPY_BUFFER_SIZE", &mut self.copy_buffer_size)?;
        Ok(())
    }

    /// The open hints files get by default.
    pub fn open_hints(&self) -> OpenHints {
        OpenHints::new(self.buffer_size, self.replication, self.block_size)
    }

    /// Connect through `transport`, tracked by the global registry.
    pub fn connect(&self, transport: Arc<dyn Transport>) -> Result<FilesystemHandle, DfsError> {
        self.connect_with_registry(transport, SessionRegistry::global())
    }

    /// Connect through `transport`, tracked by `registry`.
    pub fn connect_with_registry(
        &self,
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
    ) -> Result<FilesystemHandle, DfsError> {
        let fs = FilesystemHandle::connect_with_registry(transport, &self.host, self.port, &self.user, registry)?;
        fs.set_default_hints(self.open_hints());
        fs.set_copy_buffer_size(self.copy_buffer_size);
        Ok(fs)
    }
}

fn override_parsed<F, T>(lookup: &F, variable: &'static str, field: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(variable) {
        *field = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVariable { variable, value })?;
    }
    Ok(())
}
