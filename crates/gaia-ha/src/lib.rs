//! HealthWatchdog (C9) and HARouter (C10): detects live-service failure and
//! reroutes traffic to a pre-warmed candidate, re-promotes live when it
//! recovers, and honors an operator maintenance freeze.
//!
//! The watchdog is a single-threaded cooperative loop: one `tick()` probes
//! every registered role once, updates per-role failure/success streaks,
//! and flips routes under hysteresis. `HaRouter` is the read-only side —
//! it never does I/O, it only looks up the table the watchdog writes.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gaia_proto::config::WatchdogConfig;
use gaia_proto::health::HealthProbe;
use gaia_proto::model::{Endpoint, HaStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// An operator-controlled freeze: while set, `HealthWatchdog::tick` still
/// observes health but never changes a route.
pub trait MaintenanceFlag: Send + Sync {
    fn is_set(&self) -> bool;
}

/// Presence of a well-known path on shared storage signals maintenance
/// mode. Checked fresh on every tick — no caching beyond one tick, per the
/// cross-process rendezvous contract.
pub struct FileMaintenanceFlag {
    path: PathBuf,
}

impl FileMaintenanceFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MaintenanceFlag for FileMaintenanceFlag {
    fn is_set(&self) -> bool {
        Path::new(&self.path).exists()
    }
}

/// Test/in-process double for `MaintenanceFlag` backed by an `AtomicBool`.
#[derive(Default)]
pub struct MemoryMaintenanceFlag(std::sync::atomic::AtomicBool);

impl MemoryMaintenanceFlag {
    pub fn new(set: bool) -> Self {
        Self(std::sync::atomic::AtomicBool::new(set))
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, std::sync::atomic::Ordering::SeqCst);
    }
}

impl MaintenanceFlag for MemoryMaintenanceFlag {
    fn is_set(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Invoked once per tick when HA is active and maintenance is off, to keep
/// the candidate's session state within a bounded lag of live. Implemented
/// by `gaia-sync`'s `StateSyncer`; kept as a trait here so this crate has
/// no dependency on it.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn incremental(&self);
}

#[derive(Debug, Clone)]
pub struct RoleTargets {
    pub primary: Endpoint,
    pub fallback: Option<Endpoint>,
}

#[derive(Debug, Clone)]
struct RouteEntry {
    current: Endpoint,
    targets: RoleTargets,
    consecutive_failures: u32,
    consecutive_successes: u32,
    fallback_healthy: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChangeEvent {
    pub role: String,
    pub from: Endpoint,
    pub to: Endpoint,
    pub at: DateTime<Utc>,
}

/// The lookup side consumed by gateways. Makes no I/O of its own.
#[derive(Clone)]
pub struct HaRouter {
    routes: Arc<RwLock<HashMap<String, RouteEntry>>>,
}

impl HaRouter {
    pub fn route(&self, role: &str) -> Option<Endpoint> {
        self.routes.read().get(role).map(|e| e.current.clone())
    }
}

pub struct HealthWatchdog {
    config: WatchdogConfig,
    probe: Arc<dyn HealthProbe>,
    maintenance: Arc<dyn MaintenanceFlag>,
    sync: Option<Arc<dyn SyncTrigger>>,
    routes: Arc<RwLock<HashMap<String, RouteEntry>>>,
}

impl HealthWatchdog {
    pub fn new(
        config: WatchdogConfig,
        probe: Arc<dyn HealthProbe>,
        maintenance: Arc<dyn MaintenanceFlag>,
    ) -> Self {
        Self {
            config,
            probe,
            maintenance,
            sync: None,
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_sync_trigger(mut self, sync: Arc<dyn SyncTrigger>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Registers a protected role. The route starts pinned to `primary`.
    pub fn register_role(&self, role: impl Into<String>, targets: RoleTargets) {
        let current = targets.primary.clone();
        self.routes.write().insert(
            role.into(),
            RouteEntry {
                current,
                targets,
                consecutive_failures: 0,
                consecutive_successes: 0,
                fallback_healthy: None,
            },
        );
    }

    pub fn router(&self) -> HaRouter {
        HaRouter { routes: self.routes.clone() }
    }

    /// Runs one evaluation cycle over every registered role: probes
    /// primary (and candidate, if configured), updates streaks, and —
    /// unless maintenance is set — applies the hysteresis rule. Returns
    /// any route changes this tick actually made.
    pub async fn tick(&self) -> Vec<RouteChangeEvent> {
        let maintenance = self.maintenance.is_set();
        let request_timeout = Duration::from_secs(self.config.probe_request_timeout_secs);
        let roles: Vec<String> = self.routes.read().keys().cloned().collect();
        let mut events = Vec::new();

        for role in roles {
            let targets = match self.routes.read().get(&role) {
                Some(entry) => entry.targets.clone(),
                None => continue,
            };

            let primary_snapshot = self.probe.check(&targets.primary.0, request_timeout).await;
            let fallback_healthy = match &targets.fallback {
                Some(fb) => Some(self.probe.check(&fb.0, request_timeout).await.ok),
                None => None,
            };

            let mut routes = self.routes.write();
            let Some(entry) = routes.get_mut(&role) else { continue };

            if primary_snapshot.ok {
                entry.consecutive_successes += 1;
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
                entry.consecutive_successes = 0;
            }
            entry.fallback_healthy = fallback_healthy;

            if maintenance {
                continue;
            }

            let on_primary = entry.current == entry.targets.primary;
            let desired = if on_primary {
                if entry.consecutive_failures >= self.config.fail_threshold {
                    entry.targets.fallback.clone()
                } else {
                    None
                }
            } else if entry.consecutive_successes >= self.config.recover_threshold {
                Some(entry.targets.primary.clone())
            } else {
                None
            };

            if let Some(new_route) = desired {
                if new_route != entry.current {
                    let from = entry.current.clone();
                    entry.current = new_route.clone();
                    info!(role = %role, from = %from, to = %new_route, "HA route changed");
                    events.push(RouteChangeEvent { role: role.clone(), from, to: new_route, at: Utc::now() });
                }
            }
        }

        if !maintenance {
            if let Some(sync) = &self.sync {
                sync.incremental().await;
            }
        } else {
            warn!("maintenance flag set, skipping route updates and state sync this tick");
        }

        events
    }

    /// Aggregate status surfaced on the orchestrator's `/status` endpoint.
    /// `Failed` means at least one role has no reachable endpoint at all;
    /// `FailoverActive` means at least one role is currently on its
    /// fallback; `Degraded` means a role's primary has failed at least
    /// once but the hysteresis threshold hasn't flipped the route yet.
    pub fn ha_status(&self) -> HaStatus {
        let routes = self.routes.read();
        if routes.is_empty() {
            return HaStatus::Active;
        }
        let mut failed = false;
        let mut failover = false;
        let mut degraded = false;

        for entry in routes.values() {
            let on_fallback = entry.current != entry.targets.primary;
            if on_fallback {
                failover = true;
                if entry.fallback_healthy == Some(false) {
                    failed = true;
                }
            } else if entry.consecutive_failures > 0 {
                degraded = true;
                if entry.targets.fallback.is_none() {
                    failed = true;
                }
            }
        }

        if failed {
            HaStatus::Failed
        } else if failover {
            HaStatus::FailoverActive
        } else if degraded {
            HaStatus::Degraded
        } else {
            HaStatus::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaia_proto::health::{HealthOutcome, ScriptedHealthProbe};

    fn watchdog(probe: Arc<ScriptedHealthProbe>, maintenance: Arc<dyn MaintenanceFlag>) -> HealthWatchdog {
        let config = WatchdogConfig { fail_threshold: 2, recover_threshold: 3, ..WatchdogConfig::default() };
        HealthWatchdog::new(config, probe, maintenance)
    }

    #[tokio::test]
    async fn failover_then_restore_matches_scenario_3() {
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.script(
            "live-core",
            vec![
                HealthOutcome::Http(500),
                HealthOutcome::Http(500),
                HealthOutcome::Http(500),
                HealthOutcome::Http(200),
                HealthOutcome::Http(200),
                HealthOutcome::Http(200),
            ],
        );
        probe.always_healthy("candidate-core");

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(false));
        let wd = watchdog(probe, maintenance);
        wd.register_role(
            "core",
            RoleTargets { primary: "live-core".into(), fallback: Some("candidate-core".into()) },
        );
        let router = wd.router();

        wd.tick().await; // failure 1
        assert_eq!(router.route("core"), Some("live-core".into()));
        wd.tick().await; // failure 2 -> trips
        assert_eq!(router.route("core"), Some("candidate-core".into()));
        wd.tick().await; // failure 3, no change (already on fallback)
        assert_eq!(router.route("core"), Some("candidate-core".into()));

        wd.tick().await; // success 1
        assert_eq!(router.route("core"), Some("candidate-core".into()));
        wd.tick().await; // success 2
        assert_eq!(router.route("core"), Some("candidate-core".into()));
        wd.tick().await; // success 3 -> restores
        assert_eq!(router.route("core"), Some("live-core".into()));
    }

    #[tokio::test]
    async fn maintenance_freeze_blocks_route_changes() {
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_failing("live-core", 500);
        probe.always_healthy("candidate-core");

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(true));
        let wd = watchdog(probe, maintenance.clone());
        wd.register_role(
            "core",
            RoleTargets { primary: "live-core".into(), fallback: Some("candidate-core".into()) },
        );
        let router = wd.router();

        for _ in 0..10 {
            wd.tick().await;
        }
        assert_eq!(router.route("core"), Some("live-core".into()));

        maintenance.set(false);
        wd.tick().await;
        assert_eq!(router.route("core"), Some("live-core".into()));
        wd.tick().await;
        assert_eq!(router.route("core"), Some("candidate-core".into()));
    }

    #[tokio::test]
    async fn unrelated_roles_are_not_disturbed() {
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_failing("live-core", 500);
        probe.always_healthy("candidate-core");
        probe.always_healthy("live-mcp");

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(false));
        let wd = watchdog(probe, maintenance);
        wd.register_role("core", RoleTargets { primary: "live-core".into(), fallback: Some("candidate-core".into()) });
        wd.register_role("mcp", RoleTargets { primary: "live-mcp".into(), fallback: None });
        let router = wd.router();

        for _ in 0..3 {
            wd.tick().await;
        }
        assert_eq!(router.route("core"), Some("candidate-core".into()));
        assert_eq!(router.route("mcp"), Some("live-mcp".into()));
    }

    #[tokio::test]
    async fn role_with_no_fallback_and_failing_primary_is_failed_status() {
        let probe = Arc::new(ScriptedHealthProbe::new());
        probe.always_failing("live-mcp", 500);

        let maintenance = Arc::new(MemoryMaintenanceFlag::new(false));
        let wd = watchdog(probe, maintenance);
        wd.register_role("mcp", RoleTargets { primary: "live-mcp".into(), fallback: None });

        wd.tick().await;
        assert_eq!(wd.ha_status(), HaStatus::Failed);
    }

    #[test]
    fn file_maintenance_flag_reflects_path_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MAINTENANCE");
        let flag = FileMaintenanceFlag::new(&path);
        assert!(!flag.is_set());
        std::fs::write(&path, b"").unwrap();
        assert!(flag.is_set());
        std::fs::remove_file(&path).unwrap();
        assert!(!flag.is_set());
    }
}
