//! Snapshot persistence
//!
//! Stores [`StateSnapshot`]s so trip state survives process restarts.
//! The planner saves a snapshot after every completed run when a store is
//! configured.

use crate::error::{Result, TripError};
use crate::state::StateSnapshot;
use std::path::{Path, PathBuf};

/// Persists the latest state snapshot
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Latest saved snapshot, if any
    fn load(&self) -> Result<Option<StateSnapshot>>;
}

/// JSON file snapshot store
///
/// Writes go to a temp file that is renamed into place.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TripError::Config(format!(
                    "Failed to create snapshot directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, json).map_err(|e| {
            TripError::Config(format!(
                "Failed to write snapshot file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            TripError::Config(format!(
                "Failed to rename snapshot file {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), version = snapshot.version, "Snapshot saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            TripError::Config(format!(
                "Failed to read snapshot file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let snapshot: StateSnapshot = serde_json::from_str(&json).map_err(|e| {
            TripError::Config(format!(
                "Failed to parse snapshot file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), version = snapshot.version, "Snapshot loaded");
        Ok(Some(snapshot))
    }
}

/// In-memory snapshot store for tests
#[derive(Default)]
pub struct MemorySnapshotStore {
    latest: std::sync::RwLock<Option<StateSnapshot>>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut latest = self
            .latest
            .write()
            .map_err(|e| TripError::Config(format!("Failed to acquire snapshot lock: {}", e)))?;
        *latest = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<StateSnapshot>> {
        let latest = self
            .latest
            .read()
            .map_err(|e| TripError::Config(format!("Failed to acquire snapshot lock: {}", e)))?;
        Ok(latest.clone())
    }
}
