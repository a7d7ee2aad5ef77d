use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::config::Settings;
use crate::state::{FailoverRecord, StateStore};

/// Runs the external upgrade procedure and brings the managed service
/// back to a confirmed-active state afterwards.
pub struct UpgradeExecutor<'a> {
    store: &'a StateStore,
    settings: &'a Settings,
}

impl<'a> UpgradeExecutor<'a> {
    pub fn new(store: &'a StateStore, settings: &'a Settings) -> Self {
        Self { store, settings }
    }

    /// Invokes the upgrade command with the decision args appended to
    /// the configured base args. A non-zero exit is fatal for this
    /// cycle; the next scheduled cycle retries from scratch.
    pub fn apply(&self, extra_args: &[String]) -> Result<()> {
        let upgrade = &self.settings.upgrade;
        let mut args = upgrade.base_args.clone();
        args.extend(extra_args.iter().cloned());

        eprintln!(
            "{{\"event\":\"upgrade_apply\",\"bin\":{},\"args\":{}}}",
            serde_json::to_string(&upgrade.bin).unwrap_or_else(|_| "\"?\"".to_string()),
            serde_json::to_string(&args).unwrap_or_else(|_| "[]".to_string())
        );

        let output = run_with_timeout(
            &upgrade.bin,
            &args,
            &self.settings.repo_dir,
            Duration::from_secs(upgrade.timeout_secs),
        )
        .with_context(|| format!("failed running upgrade command '{}'", upgrade.bin))?;

        if output.timed_out {
            return Err(anyhow!(
                "upgrade command '{}' timed out after {} seconds",
                upgrade.bin,
                upgrade.timeout_secs
            ));
        }
        if !output.success {
            return Err(anyhow!(
                "upgrade command '{}' exited with {:?}: {}",
                upgrade.bin,
                output.exit_code,
                output.stderr
            ));
        }

        Ok(())
    }

    /// Brings the service to an active state. With
    /// `restart_if_active = false` an already-active service is left
    /// alone; an inactive one is repaired. Returns `Ok(false)` (with a
    /// failover record written) when the service could not be confirmed
    /// active within the bounded poll window.
    pub fn ensure_service_active(&self, restart_if_active: bool) -> Result<bool> {
        let service = &self.settings.service;

        if let Some(unit) = service.unit.as_deref() {
            if !restart_if_active && self.unit_is_active(unit)? {
                return Ok(true);
            }

            self.restart_unit(unit)?;

            let timeout = Duration::from_secs(service.restart_timeout_secs);
            let interval = Duration::from_secs(service.poll_interval_secs);
            let started = Instant::now();
            loop {
                if self.unit_is_active(unit)? {
                    return Ok(true);
                }
                if started.elapsed() >= timeout {
                    break;
                }
                thread::sleep(interval);
            }

            self.store.write_failover(&FailoverRecord::new(
                "service failed to restart",
                &format!(
                    "unit '{}' did not report active within {} seconds",
                    unit, service.restart_timeout_secs
                ),
                None,
            ))?;
            return Ok(false);
        }

        // Bare development process: a fallback restart command decides.
        let Some((bin, args)) = service.fallback_restart_cmd.split_first() else {
            eprintln!(
                "{{\"event\":\"service_unmanaged\",\"detail\":\"no unit or fallback restart command configured\"}}"
            );
            return Ok(true);
        };

        let status = Command::new(bin)
            .args(args)
            .status()
            .with_context(|| format!("failed running fallback restart command '{}'", bin))?;
        if status.success() {
            return Ok(true);
        }

        self.store.write_failover(&FailoverRecord::new(
            "service failed to restart",
            &format!(
                "fallback restart command '{}' exited with {:?}",
                bin,
                status.code()
            ),
            None,
        ))?;
        Ok(false)
    }

    fn unit_is_active(&self, unit: &str) -> Result<bool> {
        let service = &self.settings.service;
        let output = Command::new(&service.manager_bin)
            .arg("is-active")
            .arg(unit)
            .output()
            .with_context(|| {
                format!(
                    "failed running '{} is-active {}'",
                    service.manager_bin, unit
                )
            })?;
        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(state == "active")
    }

    fn restart_unit(&self, unit: &str) -> Result<()> {
        let service = &self.settings.service;
        let output = Command::new(&service.manager_bin)
            .arg("restart")
            .arg(unit)
            .output()
            .with_context(|| {
                format!("failed running '{} restart {}'", service.manager_bin, unit)
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(anyhow!(
                "'{} restart {}' exited with {:?}: {}",
                service.manager_bin,
                unit,
                output.status.code(),
                stderr
            ));
        }
        Ok(())
    }
}

struct CommandOutput {
    success: bool,
    timed_out: bool,
    exit_code: Option<i32>,
    stderr: String,
}

fn run_with_timeout(
    bin: &str,
    args: &[String],
    cwd: &std::path::Path,
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut child = Command::new(bin)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed spawning '{}'", bin))?;

    let started = Instant::now();
    loop {
        if child
            .try_wait()
            .with_context(|| format!("failed polling '{}'", bin))?
            .is_some()
        {
            let output = child
                .wait_with_output()
                .with_context(|| format!("failed collecting output of '{}'", bin))?;
            return Ok(CommandOutput {
                success: output.status.success(),
                timed_out: false,
                exit_code: output.status.code(),
                stderr: summarize_log(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(CommandOutput {
                success: false,
                timed_out: true,
                exit_code: None,
                stderr: String::new(),
            });
        }

        thread::sleep(Duration::from_millis(50));
    }
}

fn summarize_log(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= 500 {
        return trimmed.to_string();
    }
    let prefix = trimmed.chars().take(500).collect::<String>();
    format!("{}...", prefix)
}
