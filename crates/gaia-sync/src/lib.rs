//! StateSyncer (C11): one-way replication of a fixed allowlist of
//! session-state paths from a live location to a candidate location.
//!
//! Direction is structurally enforced — every copy call takes `(live,
//! candidate)` in that order and only ever reads from `live` and writes
//! into `candidate` — never the reverse. `incremental()` copies only
//! files whose live mtime is newer than the candidate's; `full()` wipes the
//! candidate allowlist first and copies everything.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use gaia_ha::{MaintenanceFlag, SyncTrigger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("i/o error syncing {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("sync did not complete within its interval")]
    TimedOut,
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files_copied: u64,
    pub files_skipped: u64,
}

/// Copies a fixed allowlist of paths (relative to `live_root` /
/// `candidate_root`) one-way. The allowlist itself is never mutated at
/// runtime — it is fixed at construction, matching the contract's "fixed
/// allowlist" wording.
pub struct StateSyncer {
    live_root: PathBuf,
    candidate_root: PathBuf,
    allowlist: Vec<PathBuf>,
    maintenance: Arc<dyn MaintenanceFlag>,
    interval: Duration,
}

impl StateSyncer {
    pub fn new(
        live_root: impl Into<PathBuf>,
        candidate_root: impl Into<PathBuf>,
        allowlist: Vec<PathBuf>,
        maintenance: Arc<dyn MaintenanceFlag>,
        interval: Duration,
    ) -> Self {
        Self {
            live_root: live_root.into(),
            candidate_root: candidate_root.into(),
            allowlist,
            maintenance,
            interval,
        }
    }

    /// Copies only files whose live mtime is newer than the candidate's
    /// (or that don't yet exist on the candidate side). A no-op while the
    /// maintenance flag is set. Bounded by `interval`; aborts rather than
    /// run long.
    pub async fn incremental(&self) -> SyncResult<SyncReport> {
        if self.maintenance.is_set() {
            info!("maintenance flag set, incremental sync skipped");
            return Ok(SyncReport::default());
        }
        self.run_bounded(false).await
    }

    /// Wipes the candidate's allowlisted paths and copies everything from
    /// live, ignoring mtimes. Not gated by maintenance — an operator
    /// invoking `full()` is making an explicit request.
    pub async fn full(&self) -> SyncResult<SyncReport> {
        self.run_bounded(true).await
    }

    async fn run_bounded(&self, force: bool) -> SyncResult<SyncReport> {
        let live_root = self.live_root.clone();
        let candidate_root = self.candidate_root.clone();
        let allowlist = self.allowlist.clone();

        let work = tokio::task::spawn_blocking(move || sync_allowlist(&live_root, &candidate_root, &allowlist, force));

        match tokio::time::timeout(self.interval, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(_join_err)) => Err(SyncError::Io {
                path: self.live_root.clone(),
                source: std::io::Error::other("sync task panicked"),
            }),
            Err(_elapsed) => {
                warn!("state sync exceeded its interval and was abandoned");
                Err(SyncError::TimedOut)
            }
        }
    }
}

fn sync_allowlist(live_root: &Path, candidate_root: &Path, allowlist: &[PathBuf], force: bool) -> SyncResult<SyncReport> {
    let mut report = SyncReport::default();

    if force {
        for rel in allowlist {
            let dst = candidate_root.join(rel);
            if dst.is_dir() {
                std::fs::remove_dir_all(&dst).or_else(|e| if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) })
                    .map_err(|source| SyncError::Io { path: dst.clone(), source })?;
            } else if dst.exists() {
                std::fs::remove_file(&dst).map_err(|source| SyncError::Io { path: dst.clone(), source })?;
            }
        }
    }

    for rel in allowlist {
        let src = live_root.join(rel);
        if !src.exists() {
            continue;
        }
        let dst = candidate_root.join(rel);
        copy_entry(&src, &dst, force, &mut report).map_err(|source| SyncError::Io { path: src.clone(), source })?;
    }

    Ok(report)
}

fn copy_entry(live: &Path, candidate: &Path, force: bool, report: &mut SyncReport) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(live)?;
    if meta.is_dir() {
        std::fs::create_dir_all(candidate)?;
        for entry in std::fs::read_dir(live)? {
            let entry = entry?;
            let name = entry.file_name();
            copy_entry(&live.join(&name), &candidate.join(&name), force, report)?;
        }
        return Ok(());
    }

    let should_copy = force
        || match std::fs::metadata(candidate) {
            Ok(dst_meta) => meta.modified()? > dst_meta.modified()?,
            Err(_) => true,
        };

    if should_copy {
        if let Some(parent) = candidate.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(live, candidate)?;
        report.files_copied += 1;
    } else {
        report.files_skipped += 1;
    }
    Ok(())
}

/// Adapter so a `HealthWatchdog` tick can drive `incremental()` without
/// this crate's error type leaking across the boundary; failures are
/// logged, never propagated, matching the watchdog's "best effort, bounded
/// by interval" contract.
#[async_trait]
impl SyncTrigger for StateSyncer {
    async fn incremental(&self) {
        if let Err(e) = StateSyncer::incremental(self).await {
            error!(error = %e, "state sync tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaia_ha::MemoryMaintenanceFlag;
    use std::fs;
    use std::thread::sleep;

    fn syncer(live: &Path, candidate: &Path, allowlist: Vec<PathBuf>, maintenance: Arc<dyn MaintenanceFlag>) -> StateSyncer {
        StateSyncer::new(live, candidate, allowlist, maintenance, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn incremental_copies_only_newer_files() {
        let live = tempfile::tempdir().unwrap();
        let candidate = tempfile::tempdir().unwrap();
        fs::write(live.path().join("session.json"), b"v1").unwrap();

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(false));
        let syncer = syncer(live.path(), candidate.path(), vec![PathBuf::from("session.json")], maintenance);

        let report = syncer.incremental().await.unwrap();
        assert_eq!(report.files_copied, 1);
        assert_eq!(fs::read(candidate.path().join("session.json")).unwrap(), b"v1");

        let second = syncer.incremental().await.unwrap();
        assert_eq!(second.files_copied, 0);
        assert_eq!(second.files_skipped, 1);

        sleep(Duration::from_millis(10));
        fs::write(live.path().join("session.json"), b"v2").unwrap();
        let third = syncer.incremental().await.unwrap();
        assert_eq!(third.files_copied, 1);
        assert_eq!(fs::read(candidate.path().join("session.json")).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn maintenance_flag_makes_incremental_a_no_op() {
        let live = tempfile::tempdir().unwrap();
        let candidate = tempfile::tempdir().unwrap();
        fs::write(live.path().join("session.json"), b"v1").unwrap();

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(true));
        let syncer = syncer(live.path(), candidate.path(), vec![PathBuf::from("session.json")], maintenance);

        let report = syncer.incremental().await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert!(!candidate.path().join("session.json").exists());
    }

    #[tokio::test]
    async fn full_wipes_and_copies_everything_regardless_of_mtime() {
        let live = tempfile::tempdir().unwrap();
        let candidate = tempfile::tempdir().unwrap();
        fs::write(live.path().join("a.json"), b"live").unwrap();
        fs::write(candidate.path().join("a.json"), b"stale-candidate-copy").unwrap();
        fs::write(candidate.path().join("orphan.json"), b"should be wiped").unwrap();

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(false));
        let syncer = syncer(live.path(), candidate.path(), vec![PathBuf::from("a.json")], maintenance);

        syncer.full().await.unwrap();
        assert_eq!(fs::read(candidate.path().join("a.json")).unwrap(), b"live");
    }

    #[tokio::test]
    async fn never_copies_from_candidate_into_live() {
        let live = tempfile::tempdir().unwrap();
        let candidate = tempfile::tempdir().unwrap();
        fs::write(candidate.path().join("only-on-candidate.json"), b"candidate-only").unwrap();

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(false));
        let syncer = syncer(
            live.path(),
            candidate.path(),
            vec![PathBuf::from("only-on-candidate.json")],
            maintenance,
        );

        syncer.incremental().await.unwrap();
        assert!(!live.path().join("only-on-candidate.json").exists());
    }

    #[tokio::test]
    async fn directories_are_copied_recursively() {
        let live = tempfile::tempdir().unwrap();
        let candidate = tempfile::tempdir().unwrap();
        fs::create_dir_all(live.path().join("sessions/nested")).unwrap();
        fs::write(live.path().join("sessions/nested/a.txt"), b"hi").unwrap();

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(false));
        let syncer = syncer(live.path(), candidate.path(), vec![PathBuf::from("sessions")], maintenance);

        let report = syncer.incremental().await.unwrap();
        assert_eq!(report.files_copied, 1);
        assert_eq!(fs::read(candidate.path().join("sessions/nested/a.txt")).unwrap(), b"hi");
    }
}
