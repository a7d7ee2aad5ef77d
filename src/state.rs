use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::policy::Mode;

const MODE_KEY: &str = "mode";
const SKIP_LIST_KEY: &str = "skip-list";
const NET_FAILURES_KEY: &str = "net-failures";
const FAILOVER_KEY: &str = "failover.json";

/// Durable marker that the last upgrade attempt has not been confirmed
/// healthy. Presence means "manual intervention required".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverRecord {
    pub reason: String,
    pub detail: String,
    pub revision: Option<String>,
    pub timestamp: String,
}

impl FailoverRecord {
    pub fn new(reason: &str, detail: &str, revision: Option<String>) -> Self {
        Self {
            reason: reason.to_string(),
            detail: detail.to_string(),
            revision,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// File-backed key/value store owning the on-disk orchestrator state.
/// All writes go through a write-then-rename replace so a concurrent
/// reader never observes a partial file. Readers treat missing or
/// unparsable files as the default value.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed creating state dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed reading state file {}", path.display()))
            }
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key)?;
        let tmp = atomic_tmp_path(&path);
        fs::write(&tmp, value)
            .with_context(|| format!("failed writing state file {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| {
            format!(
                "failed replacing state file {} -> {}",
                tmp.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed removing state file {}", path.display()))
            }
        }
    }

    pub fn mode(&self) -> Mode {
        self.get(MODE_KEY)
            .ok()
            .flatten()
            .map(|raw| Mode::parse(&raw))
            .unwrap_or(Mode::Stable)
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.set(MODE_KEY, mode.as_str())
    }

    pub fn skip_list(&self) -> Vec<String> {
        self.get(SKIP_LIST_KEY)
            .ok()
            .flatten()
            .map(|raw| {
                raw.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn skip_list_contains(&self, revision: &str) -> bool {
        self.skip_list().iter().any(|entry| entry == revision)
    }

    /// Appends a revision to the skip list. Returns false when the
    /// revision was already present (nothing written).
    pub fn append_skip(&self, revision: &str) -> Result<bool> {
        let revision = revision.trim();
        if revision.is_empty() {
            return Err(anyhow!("cannot add an empty revision to the skip list"));
        }

        let mut entries = self.skip_list();
        if entries.iter().any(|entry| entry == revision) {
            return Ok(false);
        }
        entries.push(revision.to_string());

        let mut payload = entries.join("\n");
        payload.push('\n');
        self.set(SKIP_LIST_KEY, &payload)?;
        Ok(true)
    }

    /// Operator action: drops every quarantined revision. Returns how
    /// many entries were removed.
    pub fn clear_skip_list(&self) -> Result<usize> {
        let count = self.skip_list().len();
        self.delete(SKIP_LIST_KEY)?;
        Ok(count)
    }

    pub fn net_failure_count(&self) -> u64 {
        self.get(NET_FAILURES_KEY)
            .ok()
            .flatten()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    pub fn set_net_failure_count(&self, count: u64) -> Result<()> {
        self.set(NET_FAILURES_KEY, &count.to_string())
    }

    pub fn reset_net_failures(&self) -> Result<()> {
        self.set_net_failure_count(0)
    }

    pub fn failover(&self) -> Option<FailoverRecord> {
        self.get(FAILOVER_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub fn write_failover(&self, record: &FailoverRecord) -> Result<()> {
        let payload =
            serde_json::to_string_pretty(record).context("failed encoding failover record")?;
        self.set(FAILOVER_KEY, &payload)
    }

    /// Idempotent: clearing an absent record is a no-op.
    pub fn clear_failover(&self) -> Result<()> {
        self.delete(FAILOVER_KEY)
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("state key is empty"));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' || c == '.')
        {
            return Err(anyhow!(
                "invalid state key '{}'. allowed chars: a-z, 0-9, '_', '-' and '.'",
                key
            ));
        }
        Ok(self.root.join(key))
    }
}

fn atomic_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tmp");
    path.with_file_name(format!("{file_name}.tmp"))
}
