use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRecord {
    timestamp: String,
    event: String,
    status: String,
    detail: Option<String>,
    revision: Option<String>,
    prev_hash: Option<String>,
    hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditVerifyReport {
    pub audit_log_path: String,
    pub entries: usize,
    pub last_hash: Option<String>,
    pub valid: bool,
}

/// Append-only decision/failure log. Each record carries the sha256 of
/// the previous record so truncation or edits are detectable with
/// `verify`.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("audit.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logging must never fail a cycle; errors are reported on stderr.
    pub fn append_safe(
        &self,
        event: &str,
        status: &str,
        detail: Option<&str>,
        revision: Option<&str>,
    ) {
        if let Err(err) = self.append(event, status, detail, revision) {
            eprintln!("{{\"event\":\"audit_error\",\"message\":\"{}\"}}", err);
        }
    }

    pub fn append(
        &self,
        event: &str,
        status: &str,
        detail: Option<&str>,
        revision: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating audit dir {}", parent.display()))?;
        }

        let prev_hash = read_last_hash(&self.path)?;
        let mut record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            event: event.to_string(),
            status: status.to_string(),
            detail: detail.map(ToString::to_string),
            revision: revision.map(ToString::to_string),
            prev_hash,
            hash: String::new(),
        };
        record.hash = compute_record_hash(&record);

        let line = serde_json::to_string(&record).context("failed encoding audit record")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed writing audit log {}", self.path.display()))?;
        file.write_all(b"\n")
            .with_context(|| format!("failed finalizing audit log {}", self.path.display()))?;
        Ok(())
    }

    pub fn verify(&self) -> Result<AuditVerifyReport> {
        if !self.path.exists() {
            return Ok(AuditVerifyReport {
                audit_log_path: self.path.display().to_string(),
                entries: 0,
                last_hash: None,
                valid: true,
            });
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading audit log {}", self.path.display()))?;
        let mut entries = 0usize;
        let mut expected_prev_hash: Option<String> = None;
        let mut last_hash = None;

        for (idx, line) in raw.lines().enumerate() {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(line).with_context(|| {
                format!(
                    "failed decoding audit record at line {} in {}",
                    line_no,
                    self.path.display()
                )
            })?;
            let computed = compute_record_hash(&record);
            if computed != record.hash {
                return Err(anyhow!("audit hash mismatch at line {}", line_no));
            }
            if record.prev_hash != expected_prev_hash {
                return Err(anyhow!("audit chain prev_hash mismatch at line {}", line_no));
            }

            expected_prev_hash = Some(record.hash.clone());
            last_hash = Some(record.hash);
            entries += 1;
        }

        Ok(AuditVerifyReport {
            audit_log_path: self.path.display().to_string(),
            entries,
            last_hash,
            valid: true,
        })
    }
}

fn read_last_hash(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading audit log {}", path.display()))?;
    let Some(last_line) = raw.lines().rev().find(|line| !line.trim().is_empty()) else {
        return Ok(None);
    };
    let parsed: AuditRecord =
        serde_json::from_str(last_line).context("failed decoding audit log line")?;
    if parsed.hash.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(parsed.hash))
}

fn compute_record_hash(record: &AuditRecord) -> String {
    let payload = format!(
        "timestamp={}\nevent={}\nstatus={}\ndetail={}\nrevision={}\nprev_hash={}\n",
        record.timestamp,
        record.event,
        record.status,
        record.detail.as_deref().unwrap_or_default(),
        record.revision.as_deref().unwrap_or_default(),
        record.prev_hash.as_deref().unwrap_or_default(),
    );
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::AuditLog;
    use std::fs;

    #[test]
    fn empty_log_verifies_clean() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        let report = log.verify().expect("verify");
        assert!(report.valid);
        assert_eq!(report.entries, 0);
    }

    #[test]
    fn chain_survives_multiple_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());

        log.append("decision", "upgrade", Some("0.1.25 -> 0.1.26"), None)
            .expect("append");
        log.append("health_check", "unhealthy", Some("status 502"), Some("abc123"))
            .expect("append");
        log.append("counter_reset", "ok", None, None).expect("append");

        let report = log.verify().expect("verify");
        assert!(report.valid);
        assert_eq!(report.entries, 3);
        assert!(report.last_hash.is_some());
    }

    #[test]
    fn tampered_record_fails_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());

        log.append("decision", "noop", None, None).expect("append");
        log.append("decision", "skip", Some("blocked revision"), Some("abc"))
            .expect("append");

        let raw = fs::read_to_string(log.path()).expect("read");
        let tampered = raw.replace("blocked revision", "looks fine");
        fs::write(log.path(), tampered).expect("write");

        assert!(log.verify().is_err());
    }

    #[test]
    fn append_safe_swallows_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Point the log at a path whose parent is a file, so appends fail.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").expect("write blocker");
        let log = AuditLog::new(blocker.join("nested"));
        log.append_safe("decision", "noop", None, None);
    }
}
