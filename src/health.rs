use std::env;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::config::Settings;
use crate::state::{FailoverRecord, StateStore};
use crate::version::VersionResolver;

/// Terminal states of one scheduled check. The orchestrator never
/// retries a finished check; the next opportunity comes from a future
/// cycle once the blocked revision is superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Healthy,
    Unhealthy,
}

/// Confirms post-upgrade service health with a single delayed HTTP
/// probe, and quarantines the running revision when the probe fails.
pub struct HealthVerifier<'a> {
    store: &'a StateStore,
    settings: &'a Settings,
}

impl<'a> HealthVerifier<'a> {
    pub fn new(store: &'a StateStore, settings: &'a Settings) -> Self {
        Self { store, settings }
    }

    /// Schedule-and-return: the deferred check runs as a detached
    /// re-invocation of this executable, so the cycle returns
    /// immediately after a successful upgrade+restart.
    pub fn schedule(&self, delay_secs: u64, attempt: u32) -> Result<()> {
        let exe = env::current_exe().context("failed resolving current executable")?;
        Command::new(&exe)
            .arg("verify")
            .arg("--delay")
            .arg(delay_secs.to_string())
            .arg("--attempt")
            .arg(attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed scheduling health check via {}", exe.display()))?;

        eprintln!(
            "{{\"event\":\"health_check_scheduled\",\"delay_secs\":{},\"attempt\":{}}}",
            delay_secs, attempt
        );
        Ok(())
    }

    /// Runs one check after the requested delay. Exactly one probe is
    /// issued; 200 is healthy, every other status or transport failure
    /// is unhealthy.
    pub fn run_scheduled(&self, delay_secs: u64, attempt: u32) -> Result<CheckOutcome> {
        if delay_secs > 0 {
            thread::sleep(Duration::from_secs(delay_secs));
        }
        self.verify(attempt)
    }

    pub fn verify(&self, attempt: u32) -> Result<CheckOutcome> {
        let status = self.probe();

        match status {
            Ok(200) => {
                self.store.clear_failover()?;
                eprintln!(
                    "{{\"event\":\"health_check\",\"status\":\"healthy\",\"attempt\":{}}}",
                    attempt
                );
                Ok(CheckOutcome::Healthy)
            }
            Ok(code) => self.record_unhealthy(attempt, &format!("status {}", code)),
            Err(err) => self.record_unhealthy(attempt, &err.to_string()),
        }
    }

    fn record_unhealthy(&self, attempt: u32, detail: &str) -> Result<CheckOutcome> {
        let revision = VersionResolver::from_settings(self.settings)
            .local_revision()
            .ok();

        if let Some(revision) = revision.as_deref() {
            let added = self.store.append_skip(revision)?;
            if added {
                eprintln!(
                    "{{\"event\":\"revision_blocked\",\"revision\":{}}}",
                    serde_json::to_string(revision).unwrap_or_else(|_| "\"?\"".to_string())
                );
            }
        }

        self.store.write_failover(&FailoverRecord::new(
            "health check failed",
            detail,
            revision.clone(),
        ))?;
        eprintln!(
            "{{\"event\":\"health_check\",\"status\":\"unhealthy\",\"attempt\":{},\"detail\":{}}}",
            attempt,
            serde_json::to_string(detail).unwrap_or_else(|_| "\"<encode-error>\"".to_string())
        );
        Ok(CheckOutcome::Unhealthy)
    }

    /// Single bounded HTTP GET through the probe collaborator.
    fn probe(&self) -> Result<u16> {
        let health = &self.settings.health;
        let output = Command::new(&health.probe_bin)
            .arg("-sS")
            .arg("-o")
            .arg("/dev/null")
            .arg("-w")
            .arg("%{http_code}")
            .arg("-m")
            .arg(health.timeout_secs.to_string())
            .arg(&health.url)
            .output()
            .with_context(|| format!("failed running health probe for {}", health.url))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(anyhow!(
                "health probe failed for {}: exit={:?}, stderr={}",
                health.url,
                output.status.code(),
                if stderr.is_empty() {
                    "<empty>"
                } else {
                    stderr.as_str()
                }
            ));
        }

        stdout
            .parse::<u16>()
            .with_context(|| format!("health probe returned non-numeric status '{}'", stdout))
    }
}
