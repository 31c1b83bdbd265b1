//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::ring::TRAILER_LENGTH;
use crate::stream_id::MAX_WORKERS;

/// Configuration shared by every worker of an engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the per-worker `data<N>` streams files.
    pub directory: PathBuf,
    /// Usable capacity of each streams ring in bytes (power of two).
    pub streams_buffer_capacity: usize,
    /// Number of workers, at most 128.
    pub worker_count: usize,
    /// Deliver synthetic ABORT frames to stream handlers on bulk detach.
    pub synthetic_abort: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".flowgate/engine"),
            streams_buffer_capacity: 1024 * 1024, // 1 MiB
            worker_count: 1,
            synthetic_abort: true,
        }
    }
}

impl EngineConfig {
    /// Creates a default configuration rooted at `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Sets the streams ring capacity.
    pub fn with_streams_buffer_capacity(mut self, capacity: usize) -> Self {
        self.streams_buffer_capacity = capacity;
        self
    }

    /// Sets the worker count.
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Enables or disables synthetic ABORT frames on bulk detach.
    pub fn with_synthetic_abort(mut self, enabled: bool) -> Self {
        self.synthetic_abort = enabled;
        self
    }

    /// Checks the configuration for values the ring and id scheme cannot represent.
    pub fn validate(&self) -> Result<()> {
        if !self.streams_buffer_capacity.is_power_of_two() {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "streams_buffer_capacity {} is not a power of two",
                    self.streams_buffer_capacity
                ),
            });
        }

        if self.streams_buffer_capacity > i32::MAX as usize {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "streams_buffer_capacity {} exceeds i32 record indexing",
                    self.streams_buffer_capacity
                ),
            });
        }

        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "worker_count {} must be between 1 and {}",
                    self.worker_count, MAX_WORKERS
                ),
            });
        }

        Ok(())
    }

    /// Returns the conventional streams file path for worker `index`.
    pub fn streams_path(&self, index: usize) -> PathBuf {
        streams_path(&self.directory, index)
    }

    /// Returns the total streams file length, ring capacity plus trailer.
    pub fn streams_file_length(&self) -> usize {
        self.streams_buffer_capacity + TRAILER_LENGTH
    }
}

/// Returns `<directory>/data<index>`.
pub fn streams_path(directory: &Path, index: usize) -> PathBuf {
    directory.join(format!("data{}", index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.streams_buffer_capacity, 1024 * 1024);
        assert_eq!(config.worker_count, 1);
        assert!(config.synthetic_abort);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_streams_path_naming() {
        let config = EngineConfig::new("/var/run/flowgate");
        assert_eq!(
            config.streams_path(3),
            PathBuf::from("/var/run/flowgate/data3")
        );
        assert_eq!(
            config.streams_path(0),
            PathBuf::from("/var/run/flowgate/data0")
        );
    }

    #[test]
    fn test_validate_rejects_non_power_of_two() {
        let config = EngineConfig::default().with_streams_buffer_capacity(1000);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[test]
    fn test_validate_worker_bounds() {
        assert!(EngineConfig::default().with_worker_count(0).validate().is_err());
        assert!(EngineConfig::default().with_worker_count(128).validate().is_ok());
        assert!(EngineConfig::default().with_worker_count(129).validate().is_err());
    }

    #[test]
    fn test_streams_file_length() {
        let config = EngineConfig::default().with_streams_buffer_capacity(4096);
        assert_eq!(config.streams_file_length(), 4096 + TRAILER_LENGTH);
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::new("/tmp/engine")
            .with_worker_count(4)
            .with_synthetic_abort(false);
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(back.directory, config.directory);
        assert_eq!(back.worker_count, 4);
        assert_eq!(back.streams_buffer_capacity, config.streams_buffer_capacity);
        assert!(!back.synthetic_abort);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"worker_count": 2}"#).unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.streams_buffer_capacity, 1024 * 1024);
        assert!(config.synthetic_abort);
    }
}
