use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::decompose::DEFAULT_CHUNK_SIZE;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tuning for every part of a sync, loadable from TOML.
///
/// Every section and field may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub decompose: DecomposeConfig,
    pub send: SendConfig,
    pub receive: ReceiveConfig,
    pub local_cache: LocalCacheConfig,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecomposeConfig {
    /// Chunk size for chunked keys that do not name one.
    pub chunk_size: usize,
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    pub upload_batch_size: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            upload_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    pub fetch_batch_size: usize,
    pub fetch_concurrency: usize,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            fetch_batch_size: 10_000,
            fetch_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Saves buffered before `save` waits for the writer.
    pub queue_capacity: usize,
    /// Records per committed write batch.
    pub max_transaction_size: usize,
    /// Database directory. `None` uses the per-user data directory.
    pub path: Option<PathBuf>,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            max_transaction_size: 1000,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub has_batch_size: usize,
    pub get_batch_size: usize,
    pub max_batch_records: usize,
    pub max_batch_bytes: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            has_batch_size: 100_000,
            get_batch_size: 10_000,
            max_batch_records: 1000,
            max_batch_bytes: 25_000_000,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Rejects sizes that would stall a sync.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("decompose.chunk_size", self.decompose.chunk_size),
            ("send.upload_batch_size", self.send.upload_batch_size),
            ("receive.fetch_batch_size", self.receive.fetch_batch_size),
            ("receive.fetch_concurrency", self.receive.fetch_concurrency),
            ("local_cache.queue_capacity", self.local_cache.queue_capacity),
            (
                "local_cache.max_transaction_size",
                self.local_cache.max_transaction_size,
            ),
            ("remote.has_batch_size", self.remote.has_batch_size),
            ("remote.get_batch_size", self.remote.get_batch_size),
            ("remote.max_batch_records", self.remote.max_batch_records),
            ("remote.max_batch_bytes", self.remote.max_batch_bytes),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }
        if self.remote.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "remote.max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
