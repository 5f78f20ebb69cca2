//! Logging for harden runs
//!
//! Two channels: `tracing` diagnostics on stderr, and one JSONL record per
//! `apply`/`rollback` invocation appended to the run log.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--debug` beats `--verbose` beats the
/// configured level.
pub fn init_tracing(config_level: &str, verbose: bool, debug: bool) {
    let filter = if let Ok(env) = EnvFilter::try_from_default_env() {
        env
    } else if debug {
        EnvFilter::new("debug")
    } else if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new(config_level)
    };

    // try_init: tests and repeated calls must not panic
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Log entry for each invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// RFC 3339 timestamp
    pub ts: String,

    /// Run identifier (backup directory name)
    pub run_id: String,

    pub command: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default)]
    pub modes: Vec<String>,

    pub dry_run: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<String>,

    pub ok: bool,

    pub exit_code: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub duration_ms: u64,
}

impl RunLogEntry {
    /// Append to the run log, falling back to stderr when the file cannot be
    /// written. Logging never fails the run.
    pub fn write(&self, path: &Path) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize run log entry");
                return;
            }
        };

        if let Err(e) = Self::append(&json, path) {
            tracing::debug!(error = %e, path = %path.display(), "Run log not writable");
            eprintln!("{}", json);
        }
    }

    fn append(json: &str, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(ok: bool) -> RunLogEntry {
        RunLogEntry {
            ts: "2026-01-01T00:00:00Z".to_string(),
            run_id: "20260101-000000".to_string(),
            command: "apply".to_string(),
            profile: Some("standard".to_string()),
            port: Some(22),
            modes: vec!["all".to_string()],
            dry_run: false,
            backup_dir: None,
            ok,
            exit_code: if ok { 0 } else { 3 },
            error: None,
            duration_ms: 12,
        }
    }

    #[test]
    fn test_entries_are_appended_as_jsonl() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("nested/runs.jsonl");

        entry(true).write(&log);
        entry(false).write(&log);

        let contents = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: RunLogEntry = serde_json::from_str(lines[1]).unwrap();
        assert!(!parsed.ok);
        assert_eq!(parsed.exit_code, 3);
    }

    #[test]
    fn test_optional_fields_are_skipped() {
        let mut e = entry(true);
        e.profile = None;
        let json = serde_json::to_string(&e).unwrap();
        assert!(!json.contains("profile"));
        assert!(!json.contains("backup_dir"));
    }
}
