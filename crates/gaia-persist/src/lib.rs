//! JSON file-backed persistence with atomic writes.
//!
//! Provides [`JsonStore`], a generic key-value store that keeps data in
//! memory and snapshots to a JSON file on every write. Unlike a plain
//! `fs::write`, [`JsonStore::save`] writes to a temp file in the same
//! directory and renames it into place, so a reader never observes a
//! partially-written file — the property `CheckpointStore` depends on
//! (see `gaia-checkpoint`).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A simple JSON file-backed store for a single domain of data.
///
/// Keeps data in memory and snapshots to `{state_path}/state/{domain}.json`
/// on every write.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a new store for the given domain under `state_path`.
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load data from disk. Returns empty map if file doesn't exist.
    pub fn load<T: for<'de> Deserialize<'de>>(&self) -> HashMap<String, T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                HashMap::new()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                HashMap::new()
            }
        }
    }

    /// Save data to disk atomically: write to a sibling temp file, then
    /// rename over the destination. `rename` within the same directory is
    /// atomic on the filesystems this project targets, so a crash
    /// mid-write leaves the previous file intact rather than a partial one.
    pub fn save<T: Serialize>(&self, data: &HashMap<String, T>) -> std::io::Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| std::io::Error::other("store path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        write_atomic(&self.path, content.as_bytes())
    }
}

/// Write `contents` to `path` via write-temp-then-rename. The temp file
/// lives next to `path` so the rename stays within one filesystem.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    let tmp_name = format!(".{}.tmp-{}", file_name_or(path, "store"), uuid::Uuid::new_v4());
    let tmp_path = parent.join(tmp_name);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

fn file_name_or(path: &Path, default: &str) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(default)
        .to_string()
}
