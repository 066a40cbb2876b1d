use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TransferError};

const MIB: u64 = 1024 * 1024;

/// Files at or below this size go out in a single request.
pub const DEFAULT_DIRECT_THRESHOLD: u64 = 90 * MIB;
/// Part size proposed to the remote when a chunked transfer is opened.
pub const DEFAULT_CHUNK_SIZE: u64 = 90 * MIB;
pub const DEFAULT_MAX_PART_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Tunables of the transfer engine.
///
/// Every field has a default, so a config file only needs the values it
/// overrides:
///
/// ```json
/// { "direct_threshold": 10485760, "max_concurrent_tasks": 2 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub direct_threshold: u64,
    /// The remote's `initTransfer` answer wins over this value.
    pub chunk_size_hint: u64,
    /// Total attempts per part, the first one included.
    pub max_part_attempts: u32,
    #[serde(with = "duration_millis", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    pub max_concurrent_tasks: usize,
    pub directory_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            direct_threshold: DEFAULT_DIRECT_THRESHOLD,
            chunk_size_hint: DEFAULT_CHUNK_SIZE,
            max_part_attempts: DEFAULT_MAX_PART_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_concurrent_tasks: 1,
            directory_batch_size: 100,
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.direct_threshold == 0, "direct_threshold must be > 0"),
            (self.chunk_size_hint == 0, "chunk_size_hint must be > 0"),
            (self.max_part_attempts == 0, "max_part_attempts must be >= 1"),
            (self.max_concurrent_tasks == 0, "max_concurrent_tasks must be >= 1"),
            (self.directory_batch_size == 0, "directory_batch_size must be > 0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(TransferError::InvalidConfig((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn with_direct_threshold(mut self, bytes: u64) -> Self {
        self.direct_threshold = bytes;
        self
    }

    pub fn with_chunk_size_hint(mut self, bytes: u64) -> Self {
        self.chunk_size_hint = bytes;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.max_part_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_part_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.max_concurrent_tasks, 1);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "direct_threshold": 1024, "retry_delay_ms": 250 }"#).unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.direct_threshold, 1024);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.chunk_size_hint, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn zero_values_rejected() {
        let config = EngineConfig::default().with_max_concurrent_tasks(0);
        assert!(matches!(config.validate(), Err(TransferError::InvalidConfig(_))));

        let config = EngineConfig::default().with_retry(0, Duration::ZERO);
        assert!(matches!(config.validate(), Err(TransferError::InvalidConfig(_))));
    }
}
