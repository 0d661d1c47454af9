//! Engine configuration.
//!
//! Every knob has a default, so a config file only needs the values it changes:
//!
//! ```json
//! { "transaction_retry_count": 16, "gc": { "mode": "background", "batch_size": 512 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{StorageError, StorageResult};

/// How garbage collection steps are run once the volume trigger fires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcMode {
    /// Inline, right after the `transact`/`snapshot` call that crossed the trigger.
    #[default]
    Sync,
    /// On a tokio task; the triggering call returns immediately.
    Background,
    /// Never triggered automatically; `Engine::collect_garbage` still works.
    Disabled,
}

/// Garbage collector tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub mode: GcMode,

    /// Read plus write operations between automatic steps.
    pub trigger_volume: u64,

    /// Upper bound on data entries examined by one cursor sweep, and on hot keys swept per step.
    pub batch_size: usize,

    /// Number of independent data-sweep cursors.
    pub cursor_count: usize,

    /// A lease idle for longer than this is a staleness candidate.
    pub lease_max_age_ms: u64,

    /// A lease more than this many versions behind is a staleness candidate.
    pub lease_max_version_lag: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mode: GcMode::Sync,
            trigger_volume: 1000,
            batch_size: 256,
            cursor_count: 2,
            lease_max_age_ms: 30_000,
            lease_max_version_lag: 1000,
        }
    }
}

impl GcConfig {
    pub fn lease_max_age(&self) -> Duration {
        Duration::from_millis(self.lease_max_age_ms)
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Extra attempts after a serialization conflict. 0 surfaces the first conflict.
    pub transaction_retry_count: u32,

    pub gc: GcConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transaction_retry_count: 8,
            gc: GcConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StorageError::InvalidArgument(format!("cannot read config {:?}: {}", path, e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            StorageError::InvalidArgument(format!("invalid config {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.gc.batch_size == 0 {
            return Err(StorageError::InvalidArgument(
                "gc.batch_size must be positive".to_string(),
            ));
        }
        if self.gc.cursor_count == 0 || self.gc.cursor_count > usize::from(u8::MAX) + 1 {
            return Err(StorageError::InvalidArgument(
                "gc.cursor_count must be between 1 and 256".to_string(),
            ));
        }
        if self.gc.trigger_volume == 0 {
            return Err(StorageError::InvalidArgument(
                "gc.trigger_volume must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "gc": { "mode": "background", "batch_size": 8 } }"#).unwrap();
        assert_eq!(config.transaction_retry_count, 8);
        assert_eq!(config.gc.mode, GcMode::Background);
        assert_eq!(config.gc.batch_size, 8);
        assert_eq!(config.gc.cursor_count, 2);
        assert_eq!(config.gc.lease_max_age(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "transaction_retry_count": 0 }"#).unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.transaction_retry_count, 0);
        assert_eq!(config.gc, GcConfig::default());

        std::fs::write(&path, r#"{ "gc": { "cursor_count": 0 } }"#).unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(&path),
            Err(StorageError::InvalidArgument(_))
        ));
    }
}
