use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const ENV_FILE_ENV: &str = "STEWARD_ENV_FILE";

#[derive(Debug, Clone)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub vcs: VcsSettings,
    pub upgrade: UpgradeSettings,
    pub service: ServiceSettings,
    pub health: HealthSettings,
    pub netfail: NetFailureSettings,
    pub cycle_lock_stale_after_secs: Option<u64>,
    pub auto_recover_stale_lock: bool,
}

#[derive(Debug, Clone)]
pub struct VcsSettings {
    pub bin: String,
    pub remote: String,
    pub branch: String,
    pub version_file: String,
    pub release_index: Option<PathBuf>,
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct UpgradeSettings {
    pub bin: String,
    pub base_args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub manager_bin: String,
    pub unit: Option<String>,
    pub fallback_restart_cmd: Vec<String>,
    pub restart_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub url: String,
    pub probe_bin: String,
    pub timeout_secs: u64,
    pub delay_secs: u64,
}

#[derive(Debug, Clone)]
pub struct NetFailureSettings {
    pub reboot_threshold: u64,
    pub reboot_cmd: Vec<String>,
    pub workload_marker: PathBuf,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let state_dir = env::var("STEWARD_STATE_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./state"));

        let repo_dir = env::var("STEWARD_REPO_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let vcs = VcsSettings {
            bin: read_trimmed_env("STEWARD_VCS_BIN", "git"),
            remote: read_trimmed_env("STEWARD_VCS_REMOTE", "origin"),
            branch: read_trimmed_env("STEWARD_VCS_BRANCH", "master"),
            version_file: read_trimmed_env("STEWARD_VERSION_FILE", "VERSION"),
            release_index: read_non_empty_env("STEWARD_RELEASE_INDEX").map(PathBuf::from),
            fetch_timeout_secs: read_u64_env("STEWARD_VCS_FETCH_TIMEOUT_SECS", 120).max(1),
        };

        let upgrade = UpgradeSettings {
            bin: read_trimmed_env("STEWARD_UPGRADE_BIN", "steward-upgrade"),
            base_args: read_args_env("STEWARD_UPGRADE_ARGS"),
            timeout_secs: read_u64_env("STEWARD_UPGRADE_TIMEOUT_SECS", 600).max(1),
        };

        let service = ServiceSettings {
            manager_bin: read_trimmed_env("STEWARD_SERVICE_MANAGER_BIN", "systemctl"),
            unit: read_non_empty_env("STEWARD_SERVICE_UNIT"),
            fallback_restart_cmd: read_args_env("STEWARD_SERVICE_FALLBACK_RESTART_CMD"),
            restart_timeout_secs: read_u64_env("STEWARD_SERVICE_RESTART_TIMEOUT_SECS", 30).max(1),
            poll_interval_secs: read_u64_env("STEWARD_SERVICE_POLL_INTERVAL_SECS", 2).max(1),
        };

        let health = HealthSettings {
            url: read_trimmed_env("STEWARD_HEALTH_URL", "http://127.0.0.1:8000/"),
            probe_bin: read_trimmed_env("STEWARD_HEALTH_PROBE_BIN", "curl"),
            timeout_secs: read_u64_env("STEWARD_HEALTH_TIMEOUT_SECS", 10).max(1),
            delay_secs: read_u64_env("STEWARD_HEALTH_DELAY_SECS", 60),
        };

        let netfail = NetFailureSettings {
            reboot_threshold: read_u64_env("STEWARD_NET_FAILURE_REBOOT_THRESHOLD", 3).max(1),
            reboot_cmd: {
                let cmd = read_args_env("STEWARD_REBOOT_CMD");
                if cmd.is_empty() {
                    vec!["/sbin/reboot".to_string()]
                } else {
                    cmd
                }
            },
            workload_marker: env::var("STEWARD_WORKLOAD_MARKER")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/run/steward/active-session")),
        };

        Ok(Self {
            state_dir,
            repo_dir,
            vcs,
            upgrade,
            service,
            health,
            netfail,
            cycle_lock_stale_after_secs: Some(read_u64_env(
                "STEWARD_CYCLE_LOCK_STALE_AFTER_SECS",
                900,
            ))
            .filter(|value| *value > 0),
            auto_recover_stale_lock: read_bool_env("STEWARD_AUTO_RECOVER_STALE_LOCK", true),
        })
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();

        if !(self.health.url.starts_with("http://") || self.health.url.starts_with("https://")) {
            warnings.push("STEWARD_HEALTH_URL must start with http:// or https://".to_string());
        }
        if self.health.delay_secs == 0 {
            warnings.push(
                "STEWARD_HEALTH_DELAY_SECS is 0; the post-upgrade check runs immediately and may probe a service that is still starting"
                    .to_string(),
            );
        }
        if self.service.unit.is_none() && self.service.fallback_restart_cmd.is_empty() {
            warnings.push(
                "Neither STEWARD_SERVICE_UNIT nor STEWARD_SERVICE_FALLBACK_RESTART_CMD is set; restarts after an upgrade cannot be confirmed"
                    .to_string(),
            );
        }
        if self.service.poll_interval_secs > self.service.restart_timeout_secs {
            warnings.push(
                "STEWARD_SERVICE_POLL_INTERVAL_SECS exceeds STEWARD_SERVICE_RESTART_TIMEOUT_SECS; the restart poll runs at most once"
                    .to_string(),
            );
        }
        if self.vcs.release_index.is_none() {
            warnings.push(
                "STEWARD_RELEASE_INDEX is unset; every remote version is treated as severity 'normal'"
                    .to_string(),
            );
        }
        if self.upgrade.bin.trim().is_empty() {
            warnings.push("STEWARD_UPGRADE_BIN is empty".to_string());
        }
        if self.cycle_lock_stale_after_secs.is_none() && self.auto_recover_stale_lock {
            warnings.push(
                "STEWARD_AUTO_RECOVER_STALE_LOCK=true but STEWARD_CYCLE_LOCK_STALE_AFTER_SECS is 0/disabled"
                    .to_string(),
            );
        }
        if !self.repo_dir.exists() {
            warnings.push(format!(
                "STEWARD_REPO_DIR {} does not exist",
                self.repo_dir.display()
            ));
        }

        DoctorReport {
            state_dir: self.state_dir.clone(),
            repo_dir: self.repo_dir.clone(),
            vcs_bin: self.vcs.bin.clone(),
            vcs_remote: self.vcs.remote.clone(),
            vcs_branch: self.vcs.branch.clone(),
            version_file: self.vcs.version_file.clone(),
            release_index_loaded: self.vcs.release_index.is_some(),
            upgrade_bin: self.upgrade.bin.clone(),
            service_unit: self.service.unit.clone(),
            service_fallback_configured: !self.service.fallback_restart_cmd.is_empty(),
            restart_timeout_secs: self.service.restart_timeout_secs,
            health_url: self.health.url.clone(),
            health_timeout_secs: self.health.timeout_secs,
            health_delay_secs: self.health.delay_secs,
            reboot_threshold: self.netfail.reboot_threshold,
            workload_marker: self.netfail.workload_marker.clone(),
            warnings,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DoctorReport {
    pub state_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub vcs_bin: String,
    pub vcs_remote: String,
    pub vcs_branch: String,
    pub version_file: String,
    pub release_index_loaded: bool,
    pub upgrade_bin: String,
    pub service_unit: Option<String>,
    pub service_fallback_configured: bool,
    pub restart_timeout_secs: u64,
    pub health_url: String,
    pub health_timeout_secs: u64,
    pub health_delay_secs: u64,
    pub reboot_threshold: u64,
    pub workload_marker: PathBuf,
    pub warnings: Vec<String>,
}

fn read_trimmed_env(key: &str, default: &str) -> String {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .to_string()
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn read_args_env(key: &str) -> Vec<String> {
    let Some(value) = env::var(key).ok() else {
        return Vec::new();
    };

    value
        .split_whitespace()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
