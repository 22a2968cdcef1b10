//! Append-only JSON task logs, one file per stage.
//!
//! The logs exist for audit and replay, not correctness: a lost append is a
//! gap in the audit trail, never a scheduling bug. Each file holds a single
//! JSON array; an append is a read-modify-write of the whole array guarded by
//! a mutex, since concurrent execution units share one log per stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{FlywheelError, Result};

/// A shared handle to one stage's task log.
#[derive(Clone)]
pub struct TaskLog {
    path: PathBuf,
    // Serializes the read-modify-write cycle across execution units.
    lock: Arc<Mutex<()>>,
}

impl TaskLog {
    /// Open (or create) the log at `path`. Parent directories are created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FlywheelError::io(parent, e))?;
        }
        Ok(Self {
            path,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Append one entry to the log array.
    pub async fn append<T: Serialize>(&self, entry: &T) -> Result<()> {
        let value =
            serde_json::to_value(entry).map_err(|e| FlywheelError::validation(e.to_string()))?;

        let _guard = self.lock.lock().await;

        let mut entries = read_json_array(&self.path);
        entries.push(value);
        write_json_array(&self.path, &entries)?;

        debug!(path = %self.path.display(), total = entries.len(), "task log appended");
        Ok(())
    }

    /// Read all logged entries. A missing or corrupt file reads as empty.
    pub async fn entries(&self) -> Vec<Value> {
        let _guard = self.lock.lock().await;
        read_json_array(&self.path)
    }
}

/// Read a JSON array from `path`, treating absence or corruption as empty.
fn read_json_array(path: &Path) -> Vec<Value> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<Vec<Value>>(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt task log, starting fresh");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

/// Write a JSON array to `path`, pretty-printed for hand inspection.
fn write_json_array(path: &Path, entries: &[Value]) -> Result<()> {
    let content = serde_json::to_string_pretty(entries)
        .map_err(|e| FlywheelError::validation(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| FlywheelError::io(path, e))
}
