//! Per-run state threaded through the transaction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::cutover::CutoverState;
use crate::paths::host_path;
use crate::profile::Profile;
use crate::subsystem::{Mode, Subsystem};

/// Paths this run may write, and whether their pre-state is captured yet
#[derive(Debug, Clone, Default)]
pub struct ManagedPaths {
    paths: BTreeSet<PathBuf>,
    captured: bool,
}

impl ManagedPaths {
    pub fn register(&mut self, path: impl Into<PathBuf>) {
        self.paths.insert(path.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }

    /// Set once the snapshot holding every registered path is finalized.
    pub fn mark_captured(&mut self) {
        self.captured = true;
    }

    /// A path may be written only if it is registered and captured.
    pub fn may_write(&self, path: &Path) -> bool {
        self.captured && self.paths.contains(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    Installed,
    /// Dry run: everything up to the write succeeded
    WouldInstall,
    /// Written to the staged sibling, awaiting cutover
    Staged,
    NotRendered { reason: String },
    InstallFailed { reason: String },
    ValidationFailed { output: String },
    /// Staged files discarded because a later group failed
    Abandoned,
    Cutover { state: CutoverState },
}

/// (item, outcome) for the run summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub group: String,
    pub subsystem: Subsystem,
    pub target: PathBuf,
    pub outcome: Outcome,
}

/// Mutable state of one invocation
#[derive(Debug, Clone)]
pub struct RunContext {
    pub dry_run: bool,
    /// The invoking session is carried by the remote-access daemon
    pub lockout_hazard: bool,
    pub profile: Profile,
    pub port: u16,
    pub modes: Vec<Mode>,
    pub root: PathBuf,
    /// Kernel parameter tree consulted by the kernel parameter check
    pub proc_sys: PathBuf,
    pub managed: ManagedPaths,
    pub results: Vec<ItemResult>,
}

impl RunContext {
    pub fn new(
        profile: Profile,
        port: u16,
        modes: Vec<Mode>,
        root: &Path,
        dry_run: bool,
        lockout_hazard: bool,
    ) -> Self {
        Self {
            dry_run,
            lockout_hazard,
            profile,
            port,
            modes,
            root: root.to_path_buf(),
            proc_sys: host_path(root, Path::new("/proc/sys")),
            managed: ManagedPaths::default(),
            results: Vec::new(),
        }
    }

    pub fn host_path(&self, path: &Path) -> PathBuf {
        host_path(&self.root, path)
    }

    pub fn record(&mut self, group: &str, subsystem: Subsystem, target: &Path, outcome: Outcome) {
        self.results.push(ItemResult {
            group: group.to_string(),
            subsystem,
            target: target.to_path_buf(),
            outcome,
        });
    }

    /// Replace the outcome of every item of `subsystem` currently at `from`.
    pub fn update(&mut self, subsystem: Subsystem, from: &Outcome, to: Outcome) {
        for result in self
            .results
            .iter_mut()
            .filter(|r| r.subsystem == subsystem && r.outcome == *from)
        {
            result.outcome = to.clone();
        }
    }

    pub fn mode_names(&self) -> Vec<String> {
        if self.modes.is_empty() {
            return vec![Mode::All.to_string()];
        }
        self.modes.iter().map(|m| m.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_paths_gate_writes() {
        let mut managed = ManagedPaths::default();
        managed.register("/etc/issue.net");
        assert!(!managed.may_write(Path::new("/etc/issue.net")));

        managed.mark_captured();
        assert!(managed.may_write(Path::new("/etc/issue.net")));
        assert!(!managed.may_write(Path::new("/etc/shadow")));
    }

    #[test]
    fn test_update_outcomes() {
        let mut ctx = RunContext::new(Profile::Minimal, 22, vec![], Path::new("/tmp/root"), true, false);
        assert_eq!(ctx.proc_sys, PathBuf::from("/tmp/root/proc/sys"));

        ctx.record("ssh-daemon", Subsystem::RemoteAccess, Path::new("/etc/ssh/sshd_config"), Outcome::Staged);
        ctx.record("kernel-base", Subsystem::Kernel, Path::new("/etc/sysctl.d/60-harden-base.conf"), Outcome::Installed);
        ctx.update(
            Subsystem::RemoteAccess,
            &Outcome::Staged,
            Outcome::Cutover {
                state: CutoverState::Deferred,
            },
        );

        assert_eq!(
            ctx.results[0].outcome,
            Outcome::Cutover {
                state: CutoverState::Deferred
            }
        );
        assert_eq!(ctx.results[1].outcome, Outcome::Installed);
        assert_eq!(ctx.mode_names(), vec!["all".to_string()]);
    }
}
