use std::path::PathBuf;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::config::Settings;
use crate::state::StateStore;
use crate::version::FetchError;

/// Substrings (matched case-insensitively) that identify a transient
/// network problem in a failed fetch/compare command. Anything else is
/// treated as fatal and is never counted.
const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "could not resolve host",
    "could not resolve proxy",
    "temporary failure in name resolution",
    "connection reset by peer",
    "connection timed out",
    "operation timed out",
    "timed out",
    "connection refused",
    "no route to host",
    "network is unreachable",
    "gnutls_handshake",
    "ssl_connect",
    "tls connection",
    "early eof",
    "the remote end hung up unexpectedly",
];

pub fn is_network_failure(text: &str) -> bool {
    let normalized = text.to_ascii_lowercase();
    NETWORK_ERROR_PATTERNS
        .iter()
        .any(|pattern| normalized.contains(pattern))
}

/// Counts consecutive classified network failures and escalates to a
/// reboot once the threshold is reached, unless a protected workload
/// (an active charge/transfer session) is in progress.
pub struct NetFailureMonitor<'a> {
    store: &'a StateStore,
    threshold: u64,
    reboot_cmd: Vec<String>,
    workload_marker: PathBuf,
}

impl<'a> NetFailureMonitor<'a> {
    pub fn from_settings(store: &'a StateStore, settings: &Settings) -> Self {
        Self {
            store,
            threshold: settings.netfail.reboot_threshold,
            reboot_cmd: settings.netfail.reboot_cmd.clone(),
            workload_marker: settings.netfail.workload_marker.clone(),
        }
    }

    pub fn classify(&self, err: &FetchError) -> bool {
        is_network_failure(&err.text())
    }

    /// Increments the persisted counter, logs the failure and, past the
    /// threshold, consults the reboot guard. Returns the new count.
    pub fn record_failure(&self, detail: &str) -> Result<u64> {
        let count = self.store.net_failure_count().saturating_add(1);
        self.store.set_net_failure_count(count)?;
        eprintln!(
            "{{\"event\":\"network_failure\",\"count\":{},\"threshold\":{},\"detail\":{}}}",
            count,
            self.threshold,
            serde_json::to_string(detail).unwrap_or_else(|_| "\"<encode-error>\"".to_string())
        );

        if count >= self.threshold {
            self.consider_reboot(count);
        }
        Ok(count)
    }

    /// Called by the orchestrator only after a cycle whose version
    /// check succeeded, including cycles that end in "no upgrade
    /// needed".
    pub fn reset(&self) -> Result<()> {
        self.store.reset_net_failures()
    }

    pub fn protected_workload_active(&self) -> bool {
        self.workload_marker.exists()
    }

    /// The counter is deliberately left at/above the threshold when the
    /// guard blocks the reboot, so every subsequent cycle re-evaluates
    /// the decision.
    fn consider_reboot(&self, count: u64) {
        if self.protected_workload_active() {
            eprintln!(
                "{{\"event\":\"reboot_skipped\",\"reason\":\"protected workload active\",\"count\":{}}}",
                count
            );
            return;
        }

        eprintln!(
            "{{\"event\":\"reboot_triggered\",\"count\":{},\"threshold\":{}}}",
            count, self.threshold
        );
        if let Err(err) = self.trigger_reboot() {
            eprintln!("{{\"event\":\"reboot_error\",\"message\":\"{}\"}}", err);
        }
    }

    fn trigger_reboot(&self) -> Result<()> {
        let (bin, args) = self
            .reboot_cmd
            .split_first()
            .ok_or_else(|| anyhow!("reboot command is empty"))?;
        let status = Command::new(bin)
            .args(args)
            .status()
            .with_context(|| format!("failed running reboot command '{}'", bin))?;
        if !status.success() {
            return Err(anyhow!(
                "reboot command '{}' exited with {:?}",
                bin,
                status.code()
            ));
        }
        Ok(())
    }
}
