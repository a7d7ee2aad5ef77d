use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use steward::config::{
    HealthSettings, NetFailureSettings, ServiceSettings, Settings, UpgradeSettings, VcsSettings,
};
use steward::health::{CheckOutcome, HealthVerifier};
use steward::orchestrator::Orchestrator;
use steward::policy::Decision;
use steward::state::StateStore;

fn write_stub(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path.display().to_string()
}

fn settings(dir: &Path) -> Settings {
    Settings {
        state_dir: dir.join("state"),
        repo_dir: dir.to_path_buf(),
        vcs: VcsSettings {
            bin: "true".to_string(),
            remote: "origin".to_string(),
            branch: "master".to_string(),
            version_file: "VERSION".to_string(),
            release_index: None,
            fetch_timeout_secs: 10,
        },
        upgrade: UpgradeSettings {
            bin: "true".to_string(),
            base_args: Vec::new(),
            timeout_secs: 10,
        },
        service: ServiceSettings {
            manager_bin: "systemctl".to_string(),
            unit: None,
            fallback_restart_cmd: Vec::new(),
            restart_timeout_secs: 5,
            poll_interval_secs: 1,
        },
        health: HealthSettings {
            url: "http://127.0.0.1:8000/".to_string(),
            probe_bin: "curl".to_string(),
            timeout_secs: 10,
            delay_secs: 0,
        },
        netfail: NetFailureSettings {
            reboot_threshold: 3,
            reboot_cmd: vec!["true".to_string()],
            workload_marker: dir.join("active-session"),
        },
        cycle_lock_stale_after_secs: Some(900),
        auto_recover_stale_lock: true,
    }
}

/// Stub VCS: patch bump 0.1.25 -> 0.1.26 on a new remote revision.
fn patch_bump_vcs(dir: &Path) -> String {
    write_stub(
        dir,
        "fake-git",
        r#"case "$1" in
fetch) exit 0 ;;
rev-parse)
  if [ "$2" = "HEAD" ]; then echo rev-old; else echo rev-new; fi ;;
show) echo 0.1.26 ;;
esac"#,
    )
}

#[test]
fn latest_mode_patch_bump_upgrades_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("VERSION"), "0.1.25\n").expect("write version");

    let upgrade_witness = dir.path().join("upgrade-args");
    let restart_flag = dir.path().join("restarted");

    let mut settings = settings(dir.path());
    settings.vcs.bin = patch_bump_vcs(dir.path());
    settings.upgrade.bin = write_stub(
        dir.path(),
        "fake-upgrade",
        &format!("echo \"$@\" > {}", upgrade_witness.display()),
    );
    settings.service.unit = Some("node.service".to_string());
    settings.service.manager_bin = write_stub(
        dir.path(),
        "fake-systemctl",
        &format!(
            r#"case "$1" in
is-active) if [ -f {flag} ]; then echo active; else echo inactive; fi ;;
restart) touch {flag} ;;
esac"#,
            flag = restart_flag.display()
        ),
    );

    // The mode lock file is case-insensitive.
    let store = StateStore::new(&settings.state_dir).expect("store");
    store.set("mode", "LATEST\n").expect("seed mode");

    let result = Orchestrator::new(settings.clone())
        .run_cycle(None)
        .expect("cycle");

    assert_eq!(result.status, "completed");
    assert!(result.upgrade_applied);
    assert_eq!(result.service_ok, Some(true));
    assert!(result.health_check_scheduled);
    assert_eq!(
        result.decision,
        Some(Decision::Upgrade {
            args: vec!["--latest".to_string(), "--no-restart".to_string()]
        })
    );

    let recorded = fs::read_to_string(&upgrade_witness).expect("upgrade ran");
    assert_eq!(recorded.trim(), "--latest --no-restart");
    assert!(restart_flag.exists());

    // The deferred check comes back healthy: no failover, no quarantine.
    settings.health.probe_bin = write_stub(dir.path(), "fake-curl", "printf 200");
    let outcome = HealthVerifier::new(&store, &settings)
        .verify(1)
        .expect("verify");
    assert_eq!(outcome, CheckOutcome::Healthy);
    assert!(store.failover().is_none());
    assert!(store.skip_list().is_empty());
}

#[test]
fn stable_mode_same_version_is_a_noop_and_resets_counter() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("VERSION"), "1.4.2\n").expect("write version");

    let upgrade_witness = dir.path().join("upgrade-args");
    let mut settings = settings(dir.path());
    settings.vcs.bin = write_stub(
        dir.path(),
        "fake-git",
        r#"case "$1" in
fetch) exit 0 ;;
rev-parse) echo rev-same ;;
show) echo 1.4.2 ;;
esac"#,
    );
    settings.upgrade.bin = write_stub(
        dir.path(),
        "fake-upgrade",
        &format!("touch {}", upgrade_witness.display()),
    );

    let store = StateStore::new(&settings.state_dir).expect("store");
    store.set_net_failure_count(2).expect("seed counter");

    let result = Orchestrator::new(settings).run_cycle(None).expect("cycle");

    assert_eq!(result.status, "completed");
    assert_eq!(result.decision, Some(Decision::NoOp));
    assert!(!result.upgrade_applied);
    assert!(!upgrade_witness.exists());
    // Version check succeeded, so the streak ends even on a no-op.
    assert_eq!(store.net_failure_count(), 0);
}

#[test]
fn restart_timeout_ends_the_cycle_without_scheduling_a_check() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("VERSION"), "0.1.25\n").expect("write version");

    let mut settings = settings(dir.path());
    settings.vcs.bin = patch_bump_vcs(dir.path());
    settings.upgrade.bin = "true".to_string();
    settings.service.unit = Some("node.service".to_string());
    settings.service.restart_timeout_secs = 1;
    settings.service.manager_bin = write_stub(
        dir.path(),
        "fake-systemctl",
        r#"case "$1" in
is-active) echo failed ;;
restart) exit 0 ;;
esac"#,
    );

    let store = StateStore::new(&settings.state_dir).expect("store");
    store.set("mode", "latest").expect("seed mode");

    let result = Orchestrator::new(settings).run_cycle(None).expect("cycle");

    assert_eq!(result.status, "restart_failed");
    assert!(result.upgrade_applied);
    assert_eq!(result.service_ok, Some(false));
    assert!(!result.health_check_scheduled);

    let failover = store.failover().expect("failover present");
    assert_eq!(failover.reason, "service failed to restart");
}

#[test]
fn failed_upgrade_command_is_fatal_for_the_cycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("VERSION"), "0.1.25\n").expect("write version");

    let mut settings = settings(dir.path());
    settings.vcs.bin = patch_bump_vcs(dir.path());
    settings.upgrade.bin = write_stub(dir.path(), "fake-upgrade", "exit 1");

    let store = StateStore::new(&settings.state_dir).expect("store");
    store.set("mode", "latest").expect("seed mode");
    store.set_net_failure_count(1).expect("seed counter");

    let err = Orchestrator::new(settings)
        .run_cycle(None)
        .expect_err("upgrade failure is fatal");
    assert!(err.to_string().contains("upgrade"));

    // The version check still succeeded, so the counter was reset
    // before the upgrade step failed.
    assert_eq!(store.net_failure_count(), 0);
}

#[test]
fn mode_override_is_one_shot_and_never_persisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("VERSION"), "1.4.2\n").expect("write version");

    let mut settings = settings(dir.path());
    settings.vcs.bin = write_stub(
        dir.path(),
        "fake-git",
        r#"case "$1" in
fetch) exit 0 ;;
rev-parse) echo rev-same ;;
show) echo 1.4.2 ;;
esac"#,
    );

    let store = StateStore::new(&settings.state_dir).expect("store");
    store.set("mode", "stable").expect("seed mode");

    let result = Orchestrator::new(settings)
        .run_cycle(Some(steward::policy::Mode::Latest))
        .expect("cycle");

    assert_eq!(result.mode, steward::policy::Mode::Latest);
    assert_eq!(store.mode(), steward::policy::Mode::Stable);
}
