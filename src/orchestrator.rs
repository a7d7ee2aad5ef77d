use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::audit::AuditLog;
use crate::config::Settings;
use crate::executor::UpgradeExecutor;
use crate::health::HealthVerifier;
use crate::netfail::NetFailureMonitor;
use crate::policy::{self, Decision, Mode, Severity};
use crate::state::StateStore;
use crate::version::VersionResolver;

/// One cycle's outcome, printed as JSON by the CLI.
#[derive(Debug, Serialize)]
pub struct CycleResult {
    pub timestamp: String,
    pub status: String,
    pub mode: Mode,
    pub local_version: Option<String>,
    pub remote_version: Option<String>,
    pub local_revision: Option<String>,
    pub remote_revision: Option<String>,
    pub severity: Option<Severity>,
    pub decision: Option<Decision>,
    pub upgrade_applied: bool,
    pub service_ok: Option<bool>,
    pub health_check_scheduled: bool,
    pub net_failure_count: u64,
}

pub struct Orchestrator {
    settings: Settings,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Runs one upgrade cycle. The external scheduler supplies
    /// periodicity; concurrent cycles are excluded by a lock file in
    /// the state dir.
    pub fn run_cycle(&self, override_mode: Option<Mode>) -> Result<CycleResult> {
        let store = StateStore::new(&self.settings.state_dir)?;
        let audit = AuditLog::new(&self.settings.state_dir);
        let _lock = CycleLock::acquire(
            store.root(),
            self.settings.cycle_lock_stale_after_secs,
            self.settings.auto_recover_stale_lock,
        )?;

        // The override is one-shot and never persisted.
        let mode = override_mode.unwrap_or_else(|| store.mode());
        let netmon = NetFailureMonitor::from_settings(&store, &self.settings);
        let resolver = VersionResolver::from_settings(&self.settings);

        let resolved = match resolver.resolve() {
            Ok(resolved) => resolved,
            Err(fetch_err) => {
                if netmon.classify(&fetch_err) {
                    let count = netmon.record_failure(&fetch_err.text())?;
                    audit.append_safe("network_failure", "counted", Some(&fetch_err.text()), None);
                    return Ok(CycleResult {
                        timestamp: Utc::now().to_rfc3339(),
                        status: "network_failure".to_string(),
                        mode,
                        local_version: None,
                        remote_version: None,
                        local_revision: None,
                        remote_revision: None,
                        severity: None,
                        decision: None,
                        upgrade_applied: false,
                        service_ok: None,
                        health_check_scheduled: false,
                        net_failure_count: count,
                    });
                }

                audit.append_safe("version_check", "fatal", Some(&fetch_err.text()), None);
                return Err(anyhow!(fetch_err).context("version check failed"));
            }
        };

        // The remote is reachable: the failure streak is over no matter
        // how the rest of the cycle ends.
        if store.net_failure_count() > 0 {
            audit.append_safe("counter_reset", "ok", None, None);
        }
        netmon.reset()?;

        let skip_list = store.skip_list();
        let decision = policy::decide(
            mode,
            &resolved.local_version,
            &resolved.remote_version,
            &resolved.remote_revision,
            &resolved.local_revision,
            resolved.severity,
            &skip_list,
        );

        eprintln!(
            "{{\"event\":\"decision\",\"mode\":\"{}\",\"local\":{},\"remote\":{},\"severity\":\"{}\",\"decision\":{}}}",
            mode.as_str(),
            serde_json::to_string(&resolved.local_version)
                .unwrap_or_else(|_| "\"?\"".to_string()),
            serde_json::to_string(&resolved.remote_version)
                .unwrap_or_else(|_| "\"?\"".to_string()),
            resolved.severity.as_str(),
            serde_json::to_string(&decision).unwrap_or_else(|_| "\"?\"".to_string())
        );

        let executor = UpgradeExecutor::new(&store, &self.settings);
        let verifier = HealthVerifier::new(&store, &self.settings);

        let mut result = CycleResult {
            timestamp: Utc::now().to_rfc3339(),
            status: "completed".to_string(),
            mode,
            local_version: Some(resolved.local_version.clone()),
            remote_version: Some(resolved.remote_version.clone()),
            local_revision: Some(resolved.local_revision.clone()),
            remote_revision: Some(resolved.remote_revision.clone()),
            severity: Some(resolved.severity),
            decision: Some(decision.clone()),
            upgrade_applied: false,
            service_ok: None,
            health_check_scheduled: false,
            net_failure_count: 0,
        };

        match &decision {
            Decision::NoOp => {
                audit.append_safe("decision", "noop", None, Some(&resolved.remote_revision));
                result.service_ok = self.reconcile_service(&executor);
            }
            Decision::Skip { reason } => {
                audit.append_safe(
                    "decision",
                    "skip",
                    Some(reason),
                    Some(&resolved.remote_revision),
                );
                result.service_ok = self.reconcile_service(&executor);
            }
            Decision::Upgrade { args } => {
                audit.append_safe(
                    "decision",
                    "upgrade",
                    Some(&format!(
                        "{} -> {}",
                        resolved.local_version, resolved.remote_version
                    )),
                    Some(&resolved.remote_revision),
                );

                if let Err(err) = executor.apply(args) {
                    audit.append_safe(
                        "upgrade",
                        "failed",
                        Some(&err.to_string()),
                        Some(&resolved.remote_revision),
                    );
                    return Err(err);
                }
                audit.append_safe("upgrade", "applied", None, Some(&resolved.remote_revision));
                result.upgrade_applied = true;

                let service_ok = executor.ensure_service_active(true)?;
                result.service_ok = Some(service_ok);
                if !service_ok {
                    audit.append_safe(
                        "service_restart",
                        "failed",
                        None,
                        Some(&resolved.remote_revision),
                    );
                    result.status = "restart_failed".to_string();
                    return Ok(result);
                }

                verifier.schedule(self.settings.health.delay_secs, 1)?;
                audit.append_safe(
                    "health_check",
                    "scheduled",
                    Some(&format!("in {} seconds", self.settings.health.delay_secs)),
                    Some(&resolved.remote_revision),
                );
                result.health_check_scheduled = true;
            }
        }

        Ok(result)
    }

    /// Best-effort repair on the non-upgrade path: a failing repair is
    /// logged but never fails the cycle.
    fn reconcile_service(&self, executor: &UpgradeExecutor<'_>) -> Option<bool> {
        match executor.ensure_service_active(false) {
            Ok(ok) => {
                if !ok {
                    eprintln!(
                        "{{\"event\":\"service_repair\",\"status\":\"failed\",\"detail\":\"service did not come back within the poll window\"}}"
                    );
                }
                Some(ok)
            }
            Err(err) => {
                eprintln!(
                    "{{\"event\":\"service_repair\",\"status\":\"error\",\"message\":{}}}",
                    serde_json::to_string(&err.to_string())
                        .unwrap_or_else(|_| "\"<encode-error>\"".to_string())
                );
                None
            }
        }
    }
}

/// Serializes cycles for one node. Persisted counters and the skip
/// list are read-modify-write, so two concurrent cycles must never run.
#[derive(Debug)]
struct CycleLock {
    path: PathBuf,
}

impl CycleLock {
    fn acquire(
        state_dir: &Path,
        stale_after_secs: Option<u64>,
        auto_recover_stale_lock: bool,
    ) -> Result<Self> {
        let path = state_dir.join("cycle.lock");
        let stale_after = stale_after_secs.filter(|value| *value > 0);

        for attempt in 0..2 {
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let age_secs = lock_age_secs(&path)?;
                    let stale =
                        stale_after.is_some_and(|threshold| age_secs.unwrap_or(0) >= threshold);
                    if attempt == 0 && auto_recover_stale_lock && stale {
                        fs::remove_file(&path).with_context(|| {
                            format!("failed removing stale cycle lock {}", path.display())
                        })?;
                        eprintln!(
                            "{{\"event\":\"cycle_lock_recovered\",\"lock\":\"{}\",\"age_secs\":{}}}",
                            path.display(),
                            age_secs.unwrap_or(0)
                        );
                        continue;
                    }

                    let mut message = format!(
                        "another cycle is already in progress (lock: {})",
                        path.display()
                    );
                    if stale {
                        message.push_str(". lock appears stale; remove it after confirming no cycle is running");
                    }
                    return Err(anyhow!(message));
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed creating cycle lock {}", path.display()));
                }
            };

            let details = format!(
                "pid={} started_at={}",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            file.write_all(details.as_bytes())
                .with_context(|| format!("failed writing cycle lock {}", path.display()))?;
            return Ok(Self { path });
        }

        Err(anyhow!(
            "failed acquiring cycle lock {}",
            path.display()
        ))
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                eprintln!(
                    "{{\"event\":\"cycle_lock_release_error\",\"message\":\"{}\"}}",
                    err
                );
            }
        }
    }
}

fn lock_age_secs(path: &Path) -> Result<Option<u64>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading cycle lock metadata {}", path.display()))
        }
    };
    let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default()
        .as_secs();
    Ok(Some(age))
}

#[cfg(test)]
mod tests {
    use super::CycleLock;
    use std::fs;

    #[test]
    fn second_acquire_is_rejected_while_lock_is_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _held = CycleLock::acquire(dir.path(), Some(900), true).expect("acquire");

        let err = CycleLock::acquire(dir.path(), Some(900), true).expect_err("must be held");
        assert!(err.to_string().contains("already in progress"));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let _lock = CycleLock::acquire(dir.path(), Some(900), true).expect("acquire");
            assert!(dir.path().join("cycle.lock").exists());
        }
        assert!(!dir.path().join("cycle.lock").exists());

        let _again = CycleLock::acquire(dir.path(), Some(900), true).expect("reacquire");
    }

    #[test]
    fn fresh_lock_is_honored_even_with_stale_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("cycle.lock"), "pid=1 started_at=now").expect("seed lock");

        assert!(CycleLock::acquire(dir.path(), Some(60), true).is_err());
        // A disabled threshold never recovers, whatever the lock age.
        assert!(CycleLock::acquire(dir.path(), Some(0), true).is_err());
    }

    #[test]
    fn stale_lock_is_recovered_when_policy_allows() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("cycle.lock"), "pid=1 started_at=old").expect("seed lock");
        std::thread::sleep(std::time::Duration::from_secs(2));

        let recovered =
            CycleLock::acquire(dir.path(), Some(1), true).expect("stale lock recovered");
        drop(recovered);
        assert!(!dir.path().join("cycle.lock").exists());
    }
}
