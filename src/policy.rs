use serde::{Deserialize, Serialize};

/// Operator-selected update channel. `Latest` tracks every revision,
/// `Stable` tracks version bumps gated by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Latest,
    Stable,
}

impl Mode {
    /// Unknown or empty input resolves to `Stable`.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("latest") {
            Mode::Latest
        } else {
            Mode::Stable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Latest => "latest",
            Mode::Stable => "stable",
        }
    }
}

/// Risk classification attached to a remote release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Low,
    Critical,
}

impl Severity {
    /// Unknown input resolves to `Normal` (fail-open).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "critical" => Severity::Critical,
            _ => Severity::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Low => "low",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    NoOp,
    Skip { reason: String },
    Upgrade { args: Vec<String> },
}

/// The ordered decision table. First match wins.
pub fn decide(
    mode: Mode,
    local_version: &str,
    remote_version: &str,
    remote_revision: &str,
    local_revision: &str,
    severity: Severity,
    skip_list: &[String],
) -> Decision {
    if skip_list.iter().any(|entry| entry == remote_revision) {
        return Decision::Skip {
            reason: "blocked revision".to_string(),
        };
    }

    match mode {
        Mode::Latest => {
            if local_revision == remote_revision {
                return Decision::NoOp;
            }
            if severity == Severity::Low && same_series(local_version, remote_version) {
                return Decision::Skip {
                    reason: "low severity patch".to_string(),
                };
            }
        }
        Mode::Stable => {
            if local_version == remote_version {
                return Decision::NoOp;
            }
            if severity != Severity::Critical && same_series(local_version, remote_version) {
                return Decision::NoOp;
            }
        }
    }

    Decision::Upgrade {
        args: upgrade_args(mode),
    }
}

/// Restart is handled by the executor, so the upgrade command always
/// gets `--no-restart`.
pub fn upgrade_args(mode: Mode) -> Vec<String> {
    match mode {
        Mode::Latest => vec!["--latest".to_string(), "--no-restart".to_string()],
        Mode::Stable => vec!["--no-restart".to_string()],
    }
}

/// True when both version strings carry the same leading `major.minor`
/// integer pair. Any parse failure means "different series", so neither
/// skip rule can suppress an upgrade on a malformed version.
pub fn same_series(a: &str, b: &str) -> bool {
    match (parse_series(a), parse_series(b)) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    }
}

fn parse_series(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim().splitn(3, '.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = parts.next()?.parse::<u64>().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::{decide, same_series, Decision, Mode, Severity};

    fn skip_list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn blocked_revision_wins_over_everything() {
        for mode in [Mode::Latest, Mode::Stable] {
            for severity in [Severity::Normal, Severity::Low, Severity::Critical] {
                let decision = decide(
                    mode,
                    "1.2.3",
                    "1.2.4",
                    "bad-rev",
                    "bad-rev",
                    severity,
                    &skip_list(&["bad-rev"]),
                );
                assert_eq!(
                    decision,
                    Decision::Skip {
                        reason: "blocked revision".to_string()
                    }
                );
            }
        }
    }

    #[test]
    fn latest_same_revision_is_noop() {
        let decision = decide(
            Mode::Latest,
            "1.2.3",
            "1.2.3",
            "rev-a",
            "rev-a",
            Severity::Normal,
            &[],
        );
        assert_eq!(decision, Decision::NoOp);
    }

    #[test]
    fn latest_low_severity_patch_in_series_is_skipped() {
        let decision = decide(
            Mode::Latest,
            "1.2.3",
            "1.2.4",
            "rev-b",
            "rev-a",
            Severity::Low,
            &[],
        );
        assert_eq!(
            decision,
            Decision::Skip {
                reason: "low severity patch".to_string()
            }
        );
    }

    #[test]
    fn latest_low_severity_new_series_upgrades() {
        let decision = decide(
            Mode::Latest,
            "1.2.9",
            "1.3.0",
            "rev-b",
            "rev-a",
            Severity::Low,
            &[],
        );
        assert_eq!(
            decision,
            Decision::Upgrade {
                args: vec!["--latest".to_string(), "--no-restart".to_string()]
            }
        );
    }

    #[test]
    fn stable_same_version_is_noop() {
        let decision = decide(
            Mode::Stable,
            "1.2.3",
            "1.2.3",
            "rev-b",
            "rev-a",
            Severity::Critical,
            &[],
        );
        assert_eq!(decision, Decision::NoOp);
    }

    #[test]
    fn stable_stays_on_current_patch_within_series() {
        let decision = decide(
            Mode::Stable,
            "1.2.3",
            "1.2.4",
            "rev-b",
            "rev-a",
            Severity::Normal,
            &[],
        );
        assert_eq!(decision, Decision::NoOp);
    }

    #[test]
    fn stable_critical_patch_upgrades() {
        let decision = decide(
            Mode::Stable,
            "1.2.3",
            "1.2.4",
            "rev-b",
            "rev-a",
            Severity::Critical,
            &[],
        );
        assert_eq!(
            decision,
            Decision::Upgrade {
                args: vec!["--no-restart".to_string()]
            }
        );
    }

    #[test]
    fn unparsable_version_counts_as_different_series() {
        assert!(!same_series("1.2.3", "unknown"));
        assert!(!same_series("unknown", "1.2.3"));
        assert!(!same_series("", ""));
        assert!(same_series("1.2.3", "1.2.99"));
        assert!(!same_series("1.2.3", "1.3.0"));

        // A stable node with a malformed local marker must upgrade
        // rather than silently stay behind.
        let decision = decide(
            Mode::Stable,
            "0",
            "1.2.4",
            "rev-b",
            "rev-a",
            Severity::Normal,
            &[],
        );
        assert_eq!(
            decision,
            Decision::Upgrade {
                args: vec!["--no-restart".to_string()]
            }
        );
    }

    #[test]
    fn end_to_end_patch_bump_on_latest_upgrades_with_channel_flag() {
        let decision = decide(
            Mode::Latest,
            "0.1.25",
            "0.1.26",
            "rev-new",
            "rev-old",
            Severity::Normal,
            &[],
        );
        assert_eq!(
            decision,
            Decision::Upgrade {
                args: vec!["--latest".to_string(), "--no-restart".to_string()]
            }
        );
    }
}
