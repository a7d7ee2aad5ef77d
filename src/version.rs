use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::warn;

use crate::config::Settings;
use crate::policy::Severity;

/// A failed version-check operation. Carries the raw failure text so the
/// network classifier can inspect it; never swallowed into a generic
/// error.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub command: String,
    pub detail: String,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' failed: {}", self.command, self.detail)
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// Full text the classifier matches against.
    pub fn text(&self) -> String {
        format!("{} {}", self.command, self.detail)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedVersions {
    pub local_version: String,
    pub remote_version: String,
    pub local_revision: String,
    pub remote_revision: String,
    pub severity: Severity,
}

#[derive(Debug, Deserialize)]
struct ReleaseIndex {
    #[serde(default)]
    releases: Vec<ReleaseEntry>,
}

#[derive(Debug, Deserialize)]
struct ReleaseEntry {
    version: String,
    #[serde(default)]
    severity: String,
}

/// Pure-read resolver for local/remote versions, revisions and the
/// remote release severity. Resolved fresh every cycle, never cached.
pub struct VersionResolver {
    bin: String,
    repo_dir: PathBuf,
    remote: String,
    branch: String,
    version_file: String,
    release_index: Option<PathBuf>,
    fetch_timeout_secs: u64,
}

impl VersionResolver {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bin: settings.vcs.bin.clone(),
            repo_dir: settings.repo_dir.clone(),
            remote: settings.vcs.remote.clone(),
            branch: settings.vcs.branch.clone(),
            version_file: settings.vcs.version_file.clone(),
            release_index: settings.vcs.release_index.clone(),
            fetch_timeout_secs: settings.vcs.fetch_timeout_secs,
        }
    }

    pub fn resolve(&self) -> Result<ResolvedVersions, FetchError> {
        self.vcs(&["fetch", &self.remote, &self.branch])?;

        let tracking_ref = format!("{}/{}", self.remote, self.branch);
        let remote_revision = self.vcs(&["rev-parse", &tracking_ref])?.trim().to_string();
        let local_revision = self.vcs(&["rev-parse", "HEAD"])?.trim().to_string();

        // An absent remote version marker behaves like an absent local
        // one: version "0", which never matches a series and therefore
        // never suppresses an upgrade.
        let remote_version = self
            .vcs(&["show", &format!("{}:{}", tracking_ref, self.version_file)])
            .map(|raw| raw.trim().to_string())
            .unwrap_or_else(|err| {
                warn!("remote version marker unreadable, treating as version 0: {err}");
                "0".to_string()
            });
        let remote_version = if remote_version.is_empty() {
            "0".to_string()
        } else {
            remote_version
        };

        let local_version = self.local_version();
        let severity = self.severity_for(&remote_version);

        Ok(ResolvedVersions {
            local_version,
            remote_version,
            local_revision,
            remote_revision,
            severity,
        })
    }

    /// Absence of the local marker is not an error; the node reports
    /// version "0".
    pub fn local_version(&self) -> String {
        fs::read_to_string(self.repo_dir.join(&self.version_file))
            .map(|raw| raw.trim().to_string())
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "0".to_string())
    }

    /// Revision currently checked out on this node.
    pub fn local_revision(&self) -> Result<String, FetchError> {
        Ok(self.vcs(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Severity lookup is fail-open: a missing index, a parse error or
    /// an unknown version all degrade to `Normal` so metadata
    /// unavailability never stalls the loop.
    pub fn severity_for(&self, version: &str) -> Severity {
        let Some(path) = self.release_index.as_ref() else {
            return Severity::Normal;
        };
        let Ok(raw) = fs::read_to_string(path) else {
            return Severity::Normal;
        };
        let Ok(index) = serde_json::from_str::<ReleaseIndex>(&raw) else {
            return Severity::Normal;
        };

        index
            .releases
            .iter()
            .find(|entry| entry.version == version)
            .map(|entry| Severity::parse(&entry.severity))
            .unwrap_or(Severity::Normal)
    }

    fn vcs(&self, args: &[&str]) -> Result<String, FetchError> {
        let command = format!("{} {}", self.bin, args.join(" "));
        let mut child = Command::new(&self.bin)
            .args(args)
            .current_dir(&self.repo_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| FetchError {
                command: command.clone(),
                detail: err.to_string(),
            })?;

        let timeout = Duration::from_secs(self.fetch_timeout_secs.max(1));
        let started = Instant::now();
        loop {
            let done = child.try_wait().map_err(|err| FetchError {
                command: command.clone(),
                detail: err.to_string(),
            })?;
            if done.is_some() {
                let output = child.wait_with_output().map_err(|err| FetchError {
                    command: command.clone(),
                    detail: err.to_string(),
                })?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    return Err(FetchError {
                        command,
                        detail: format!(
                            "exit={:?}: {}",
                            output.status.code(),
                            if stderr.is_empty() { "<no stderr>" } else { stderr.as_str() }
                        ),
                    });
                }
                return Ok(String::from_utf8_lossy(&output.stdout).to_string());
            }

            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(FetchError {
                    command,
                    detail: format!("timed out after {} seconds", timeout.as_secs()),
                });
            }

            thread::sleep(Duration::from_millis(50));
        }
    }
}
