//! Shared trip state with path-level locking and versioning
//!
//! State is one JSON document addressed by dot-separated paths
//! (`trips.run-1.itinerary`). Writers take advisory locks on paths; a lock
//! covers the whole subtree and conflicts with locks on any ancestor or
//! descendant. `update` holds a path lock of its own for the duration of the
//! write, so writers only contend when their paths overlap. Every successful
//! update bumps a global version and is broadcast to subscribers.

use crate::error::{Result, TripError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Point-in-time copy of the whole document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub data: Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast after every successful update or restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub path: String,
    pub version: u64,
    pub writer: String,
}

struct Document {
    data: Value,
    version: u64,
}

/// Locked path -> holder
type LockTable = HashMap<String, String>;

/// Versioned, lockable JSON state
pub struct StateManager {
    inner: Mutex<Document>,
    locks: Mutex<LockTable>,
    changes: broadcast::Sender<StateChange>,
}

/// Path lock taken by `update`, released on drop
///
/// Holds nothing when the writer already had a lock on the exact path.
struct PathGuard<'a> {
    locks: &'a Mutex<LockTable>,
    path: Option<String>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&path);
        }
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Document {
                data: Value::Object(Map::new()),
                version: 0,
            }),
            locks: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn version(&self) -> u64 {
        self.doc().version
    }

    /// Value at a path, if present
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments = split(path).ok()?;
        let doc = self.doc();
        let mut node = &doc.data;
        for segment in segments {
            node = node.get(segment)?;
        }
        Some(node.clone())
    }

    /// Take an advisory lock on `path` for `writer`
    ///
    /// Re-locking a path already held by the same writer succeeds. Fails with
    /// [`TripError::LockContention`] when another writer holds an overlapping
    /// path.
    pub fn lock(&self, path: &str, writer: &str) -> Result<()> {
        split(path)?;
        let mut locks = self.lock_table();
        if let Some(holder) = conflicting_holder(&locks, path, writer) {
            return Err(TripError::LockContention {
                path: path.to_string(),
                holder,
            });
        }
        locks.insert(path.to_string(), writer.to_string());
        tracing::trace!(path, writer, "Path locked");
        Ok(())
    }

    /// Release a lock held by `writer`
    pub fn unlock(&self, path: &str, writer: &str) -> Result<()> {
        let mut locks = self.lock_table();
        match locks.get(path) {
            Some(holder) if holder == writer => {
                locks.remove(path);
                tracing::trace!(path, writer, "Path unlocked");
                Ok(())
            }
            Some(holder) => Err(TripError::LockContention {
                path: path.to_string(),
                holder: holder.clone(),
            }),
            None => Err(TripError::NotFound(format!("no lock on '{}'", path))),
        }
    }

    pub fn lock_holder(&self, path: &str) -> Option<String> {
        self.lock_table().get(path).cloned()
    }

    /// Write `value` at `path`, creating intermediate objects
    ///
    /// Fails immediately when another writer holds a lock overlapping the
    /// path. Returns the new version.
    pub fn update(&self, path: &str, value: Value, writer: &str) -> Result<u64> {
        let segments = split(path)?;
        let guard = self.hold(path, writer)?;
        let version = {
            let mut doc = self.doc();
            set_at(&mut doc.data, &segments, value)?;
            doc.version += 1;
            doc.version
        };
        drop(guard);

        self.publish(path, version, writer);
        Ok(version)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let doc = self.doc();
        StateSnapshot {
            data: doc.data.clone(),
            version: doc.version,
            timestamp: Utc::now(),
        }
    }

    /// Replace the document with a snapshot's data
    ///
    /// The version keeps moving forward: it becomes `current + 1`, never the
    /// snapshot's version. Rejected while any lock is held.
    pub fn restore(&self, snapshot: &StateSnapshot, writer: &str) -> Result<u64> {
        let version = {
            let locks = self.lock_table();
            if let Some((path, holder)) = locks.iter().next() {
                return Err(TripError::LockContention {
                    path: path.clone(),
                    holder: holder.clone(),
                });
            }
            let mut doc = self.doc();
            doc.data = snapshot.data.clone();
            doc.version += 1;
            doc.version
        };

        tracing::info!(
            from_version = snapshot.version,
            version,
            writer,
            "State restored from snapshot"
        );
        self.publish("", version, writer);
        Ok(version)
    }

    /// Take a transient lock on `path` for one write
    fn hold(&self, path: &str, writer: &str) -> Result<PathGuard<'_>> {
        let mut locks = self.lock_table();
        if let Some(holder) = conflicting_holder(&locks, path, writer) {
            tracing::debug!(path, writer, holder = %holder, "Update blocked by lock");
            return Err(TripError::LockContention {
                path: path.to_string(),
                holder,
            });
        }
        let path = if locks.contains_key(path) {
            None
        } else {
            locks.insert(path.to_string(), writer.to_string());
            Some(path.to_string())
        };
        Ok(PathGuard {
            locks: &self.locks,
            path,
        })
    }

    fn doc(&self) -> MutexGuard<'_, Document> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, path: &str, version: u64, writer: &str) {
        let _ = self.changes.send(StateChange {
            path: path.to_string(),
            version,
            writer: writer.to_string(),
        });
    }
}

fn split(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(TripError::InvalidRequest(format!("invalid state path '{}'", path)));
    }
    Ok(segments)
}

/// True when one path is the other or lies beneath it
fn overlaps(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long == short || (long.starts_with(short) && long.as_bytes()[short.len()] == b'.')
}

fn conflicting_holder(locks: &HashMap<String, String>, path: &str, writer: &str) -> Option<String> {
    locks
        .iter()
        .find(|(locked, holder)| holder.as_str() != writer && overlaps(locked, path))
        .map(|(_, holder)| holder.clone())
}

fn set_at(root: &mut Value, segments: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(TripError::InvalidRequest("empty state path".into()));
    };

    let mut node = root;
    for segment in parents {
        let map = node.as_object_mut().ok_or_else(|| {
            TripError::InvalidRequest(format!("'{}' is not inside an object", segment))
        })?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let map = node
        .as_object_mut()
        .ok_or_else(|| TripError::InvalidRequest(format!("'{}' is not inside an object", last)))?;
    map.insert(last.to_string(), value);
    Ok(())
}
