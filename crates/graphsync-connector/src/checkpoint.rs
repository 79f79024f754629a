//! Checkpoint tracking and persistence.
//!
//! The tracker holds the position of the last fully handled event; the
//! store writes it to disk. The pipeline decides when to persist.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use graphsync_core::FeedPosition;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint file {path} is unreadable: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Monotonic resume position.
#[derive(Debug, Clone, Default)]
pub struct CheckpointTracker {
    current: Option<FeedPosition>,
}

impl CheckpointTracker {
    pub fn new(start: Option<FeedPosition>) -> Self {
        Self { current: start }
    }

    /// Move forward to `position`. Older positions are clamped: the tracker
    /// keeps its current value and returns `false`.
    pub fn advance(&mut self, position: FeedPosition) -> bool {
        match self.current {
            Some(current) if position < current => {
                tracing::warn!(
                    %current,
                    %position,
                    "Ignoring checkpoint regression"
                );
                false
            }
            _ => {
                self.current = Some(position);
                true
            }
        }
    }

    /// Where a restart should resume from, if anything was handled yet.
    pub fn current(&self) -> Option<FeedPosition> {
        self.current
    }
}

/// On-disk checkpoint record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub ts: FeedPosition,
    pub saved_at: DateTime<Utc>,
}

/// Durable home of the checkpoint.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<Option<FeedPosition>, CheckpointError>;
    fn save(&self, position: FeedPosition) -> Result<(), CheckpointError>;
}

/// JSON checkpoint file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<FeedPosition>, CheckpointError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }

        let checkpoint: Checkpoint =
            serde_json::from_str(&raw).map_err(|source| CheckpointError::Serialization {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(checkpoint.ts))
    }

    fn save(&self, position: FeedPosition) -> Result<(), CheckpointError> {
        let checkpoint = Checkpoint {
            ts: position,
            saved_at: Utc::now(),
        };
        let json = serde_json::to_vec(&checkpoint).map_err(|source| {
            CheckpointError::Serialization {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = std::fs::File::create(&tmp).map_err(|e| self.io_error(e))?;
        file.write_all(&json).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        tracing::debug!(path = %self.path.display(), %position, "Checkpoint saved");
        Ok(())
    }
}

/// Checkpoint held in memory only. Used by `--dry-run` so a rehearsal
/// never moves the real checkpoint.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    position: Mutex<Option<FeedPosition>>,
}

impl MemoryCheckpointStore {
    pub fn new(position: Option<FeedPosition>) -> Self {
        Self {
            position: Mutex::new(position),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<FeedPosition>, CheckpointError> {
        Ok(*self
            .position
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    fn save(&self, position: FeedPosition) -> Result<(), CheckpointError> {
        *self
            .position
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(position);
        Ok(())
    }
}
