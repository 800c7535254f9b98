//! CheckpointStore (C4): a durable key→blob store for cognitive
//! checkpoint text, keyed by service name.
//!
//! Layout on disk, per the checkpoint file layout contract:
//! `<service>.current`, `<service>.previous`, and
//! `<service>.history/<ISO8601>.txt`. Writes are atomic (write-to-temp
//! then rename); a crash at any point during `write` leaves `read`
//! returning either the previous text or the new text, never a partial
//! blob.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use gaia_persist::write_atomic;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Durable, per-key atomic text store. One instance is typically owned by
/// one `SleepWakeManager`, keyed by its own service name, but the store
/// itself is multi-key so a single process can host checkpoints for
/// several services if needed.
pub struct CheckpointStore {
    root: PathBuf,
    history_max_entries: usize,
    write_locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>, history_max_entries: usize) -> Self {
        Self {
            root: root.into(),
            history_max_entries,
            write_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn current_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.current"))
    }

    fn previous_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.previous"))
    }

    fn history_dir(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.history"))
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Atomically writes `text` as the new `current` for `key`, rotating
    /// the old `current` into `previous` first and appending a
    /// timestamped history entry. Concurrent writes for the same key are
    /// serialized by a per-key lock; writes for different keys proceed
    /// independently.
    pub async fn write(&self, key: &str, text: &str) -> CheckpointResult<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        std::fs::create_dir_all(&self.root)?;

        // Rotate current -> previous first: if we crash before the new
        // current is in place, `read` still returns a previously-valid
        // text (either the rotated-out current, now in `previous`, or —
        // if rotation itself hadn't happened yet — the untouched current).
        if let Ok(old) = std::fs::read(self.current_path(key)) {
            write_atomic(&self.previous_path(key), &old)?;
        }

        write_atomic(&self.current_path(key), text.as_bytes())?;

        self.append_history(key, text)?;
        info!(key, bytes = text.len(), "checkpoint written");
        Ok(())
    }

    fn append_history(&self, key: &str, text: &str) -> CheckpointResult<()> {
        let dir = self.history_dir(key);
        std::fs::create_dir_all(&dir)?;
        let stamp = Utc::now().to_rfc3339();
        let path = dir.join(format!("{stamp}.txt"));
        write_atomic(&path, text.as_bytes())?;
        self.prune_history(key)?;
        Ok(())
    }

    /// Deletes the oldest history files beyond `history_max_entries`.
    /// Monotonic and parameterized only by count, per the retention
    /// invariant.
    fn prune_history(&self, key: &str) -> CheckpointResult<()> {
        let dir = self.history_dir(key);
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        if entries.len() <= self.history_max_entries {
            return Ok(());
        }
        entries.sort();
        let overflow = entries.len() - self.history_max_entries;
        for path in entries.into_iter().take(overflow) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to prune checkpoint history entry");
            }
        }
        Ok(())
    }

    /// Returns the latest `current` text, or `None` if never written.
    pub fn read(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.current_path(key)).ok()
    }

    /// Returns the latest `previous` text, or `None` if no rotation has
    /// happened yet.
    pub fn read_previous(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.previous_path(key)).ok()
    }

    /// History entries in reverse chronological order, most recent first.
    pub fn history(&self, key: &str, limit: usize) -> Vec<(DateTime<Utc>, String)> {
        let dir = self.history_dir(key);
        let Ok(read_dir) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut entries: Vec<(DateTime<Utc>, PathBuf)> = read_dir
            .filter_map(|e| {
                let path = e.ok()?.path();
                let stem = path.file_stem()?.to_str()?;
                let stamp = DateTime::parse_from_rfc3339(stem).ok()?.with_timezone(&Utc);
                Some((stamp, path))
            })
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries
            .into_iter()
            .take(limit)
            .filter_map(|(stamp, path)| std::fs::read_to_string(path).ok().map(|text| (stamp, text)))
            .collect()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
