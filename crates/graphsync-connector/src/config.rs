//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Apply and checkpoint tuning.
///
/// Loaded from the `graphsync.toml` `[pipeline]` section or
/// `GRAPHSYNC__PIPELINE__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum applies in flight at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Bound on a single apply attempt, in milliseconds.
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Attempts per event, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Consecutive retry-exhausted events before the run gives up on the
    /// executor. 0 never gives up.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// How long shutdown waits for in-flight applies.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
}

fn default_max_in_flight() -> usize {
    64
}

fn default_apply_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_max_consecutive_failures() -> u32 {
    20
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_checkpoint_interval_secs() -> u64 {
    5
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./timestamp.json")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            apply_timeout_ms: default_apply_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            checkpoint_path: default_checkpoint_path(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(SyncError::Config("pipeline.max_in_flight must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("pipeline.max_attempts must be > 0".into()));
        }
        if self.apply_timeout_ms == 0 {
            return Err(SyncError::Config(
                "pipeline.apply_timeout_ms must be > 0".into(),
            ));
        }
        if self.checkpoint_interval_secs == 0 {
            return Err(SyncError::Config(
                "pipeline.checkpoint_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_in_flight, 64);
        assert_eq!(config.apply_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.checkpoint_path, PathBuf::from("./timestamp.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = PipelineConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(7), Duration::from_millis(5_000));
        assert_eq!(config.backoff(200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let config = PipelineConfig {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let config = PipelineConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"max_in_flight": 4}"#).unwrap();
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.max_attempts, 5);
    }
}
