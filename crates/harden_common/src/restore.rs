//! Restore plan and its executor
//!
//! The plan is plain data written next to the captured files. It carries
//! everything needed to undo a run (original bytes by reference, metadata,
//! restart commands) so restoring never depends on the state of the run
//! that produced it. Two consumers read it: [`RestoreExecutor`] and the
//! `restore.sh` serialization from [`render_script`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::deploy::{Deployer, FileOwner};
use crate::error::{HardenError, Result};
use crate::paths::{host_path, shell_quote};
use crate::runner::{CommandRunner, CommandSpec};
use crate::subsystem::Subsystem;

/// Bumped when the on-disk plan format changes
pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RestoreAction {
    /// Recreate a directory with its original metadata
    RestoreDir {
        path: PathBuf,
        mode: u32,
        uid: u32,
        gid: u32,
    },
    /// Rewrite a file from its captured copy
    RestoreFile {
        path: PathBuf,
        /// Relative to the snapshot directory
        backup: PathBuf,
        mode: u32,
        uid: u32,
        gid: u32,
        sha256: String,
    },
    RestoreSymlink {
        path: PathBuf,
        target: PathBuf,
    },
    /// The path did not exist before the run
    Remove { path: PathBuf },
}

impl RestoreAction {
    pub fn path(&self) -> &Path {
        match self {
            RestoreAction::RestoreDir { path, .. }
            | RestoreAction::RestoreFile { path, .. }
            | RestoreAction::RestoreSymlink { path, .. }
            | RestoreAction::Remove { path } => path,
        }
    }

    /// Directories shallow-first, then content, then removals deep-first.
    fn sort_key(&self) -> (u8, isize, PathBuf) {
        let depth = self.path().components().count() as isize;
        match self {
            RestoreAction::RestoreDir { .. } => (0, depth, self.path().to_path_buf()),
            RestoreAction::RestoreFile { .. } | RestoreAction::RestoreSymlink { .. } => {
                (1, depth, self.path().to_path_buf())
            }
            RestoreAction::Remove { .. } => (2, -depth, self.path().to_path_buf()),
        }
    }
}

/// A command that makes restored files take effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCommand {
    pub subsystem: Subsystem,
    pub argv: Vec<String>,
}

impl ServiceCommand {
    pub fn new(subsystem: Subsystem, spec: &CommandSpec) -> Self {
        Self {
            subsystem,
            argv: spec.argv(),
        }
    }

    pub fn spec(&self) -> Option<CommandSpec> {
        let (program, args) = self.argv.split_first()?;
        Some(CommandSpec::new(program.clone()).args(args.iter().cloned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePlan {
    pub version: u32,
    pub run_id: String,
    pub created_at: String,
    /// Root the managed paths were captured under
    pub root: PathBuf,
    pub actions: Vec<RestoreAction>,
    /// Already in safe order: local services first, remote access last
    pub service_commands: Vec<ServiceCommand>,
}

impl RestorePlan {
    pub fn new(
        run_id: &str,
        created_at: &str,
        root: &Path,
        mut actions: Vec<RestoreAction>,
        mut service_commands: Vec<ServiceCommand>,
    ) -> Self {
        actions.sort_by_key(|a| a.sort_key());
        // Stable: commands of one subsystem keep their relative order
        service_commands.sort_by_key(|c| c.subsystem.restart_rank());
        service_commands.dedup();

        Self {
            version: PLAN_VERSION,
            run_id: run_id.to_string(),
            created_at: created_at.to_string(),
            root: root.to_path_buf(),
            actions,
            service_commands,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let plan: RestorePlan = serde_json::from_str(&contents)?;
        if plan.version != PLAN_VERSION {
            return Err(HardenError::Snapshot {
                message: format!(
                    "unsupported restore plan version {} in {}",
                    plan.version,
                    path.display()
                ),
            });
        }
        Ok(plan)
    }
}

/// SHA-256 of `bytes` as lowercase hex
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// What a restore did
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub services_restarted: Vec<String>,
    /// (command, diagnostic) for service commands that failed
    pub service_failures: Vec<(String, String)>,
}

impl RestoreReport {
    pub fn success(&self) -> bool {
        self.service_failures.is_empty()
    }
}

/// Generic executor over a [`RestorePlan`]
pub struct RestoreExecutor<'a, R: CommandRunner> {
    runner: &'a R,
    deployer: Deployer,
}

impl<'a, R: CommandRunner> RestoreExecutor<'a, R> {
    pub fn new(runner: &'a R, deployer: Deployer) -> Self {
        Self { runner, deployer }
    }

    /// Verify every captured copy, then restore paths, then restart services.
    ///
    /// Integrity is checked before anything is touched. Path failures abort;
    /// service failures are collected so every service still gets its turn.
    pub async fn execute(&self, plan: &RestorePlan, snapshot_dir: &Path) -> Result<RestoreReport> {
        let mut payloads = Vec::with_capacity(plan.actions.len());
        for action in &plan.actions {
            payloads.push(self.load_payload(action, snapshot_dir)?);
        }

        let mut report = RestoreReport::default();

        for (action, payload) in plan.actions.iter().zip(payloads) {
            let target = host_path(&plan.root, action.path());
            match action {
                RestoreAction::RestoreDir { mode, uid, gid, .. } => {
                    self.deployer.ensure_dir(
                        &target,
                        *mode,
                        Some(FileOwner { uid: *uid, gid: *gid }),
                    )?;
                }
                RestoreAction::RestoreFile { mode, uid, gid, .. } => {
                    let bytes = payload.unwrap_or_default();
                    self.deployer.install(
                        &bytes,
                        &target,
                        *mode,
                        Some(FileOwner { uid: *uid, gid: *gid }),
                    )?;
                    report.restored.push(action.path().to_path_buf());
                }
                RestoreAction::RestoreSymlink { target: link, .. } => {
                    self.restore_symlink(&target, link)?;
                    report.restored.push(action.path().to_path_buf());
                }
                RestoreAction::Remove { .. } => {
                    if self.remove(&target)? {
                        report.removed.push(action.path().to_path_buf());
                    }
                }
            }
        }

        for command in &plan.service_commands {
            let Some(spec) = command.spec() else {
                continue;
            };

            if self.deployer.is_dry_run() {
                info!(command = %spec, "[DRY RUN] Would run");
                continue;
            }

            match self.runner.run(&spec).await {
                Ok(out) if out.success() => report.services_restarted.push(spec.to_string()),
                Ok(out) => {
                    warn!(command = %spec, "Service command failed during restore");
                    report.service_failures.push((spec.to_string(), out.diagnostic()));
                }
                Err(e) => report.service_failures.push((spec.to_string(), e.to_string())),
            }
        }

        info!(
            run_id = %plan.run_id,
            restored = report.restored.len(),
            removed = report.removed.len(),
            "Restore completed"
        );
        Ok(report)
    }

    fn load_payload(&self, action: &RestoreAction, snapshot_dir: &Path) -> Result<Option<Vec<u8>>> {
        let RestoreAction::RestoreFile {
            path,
            backup,
            sha256,
            ..
        } = action
        else {
            return Ok(None);
        };

        let copy = snapshot_dir.join(backup);
        let bytes = fs::read(&copy).map_err(|e| HardenError::RestoreFailed {
            path: path.clone(),
            message: format!("cannot read captured copy {}: {}", copy.display(), e),
        })?;

        if digest(&bytes) != *sha256 {
            return Err(HardenError::RestoreFailed {
                path: path.clone(),
                message: format!("checksum mismatch for {}", copy.display()),
            });
        }
        Ok(Some(bytes))
    }

    fn restore_symlink(&self, path: &Path, link: &Path) -> Result<()> {
        if self.deployer.is_dry_run() {
            info!(path = %path.display(), target = %link.display(), "[DRY RUN] Would relink");
            return Ok(());
        }

        let fail = |e: std::io::Error| HardenError::RestoreFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(fail)?;
        }
        let temp = crate::paths::staged_path(path);
        let _ = fs::remove_file(&temp);
        std::os::unix::fs::symlink(link, &temp).map_err(fail)?;
        fs::rename(&temp, path).map_err(fail)
    }

    /// Returns whether something was removed. Non-empty directories are
    /// left in place.
    fn remove(&self, path: &Path) -> Result<bool> {
        if self.deployer.is_dry_run() {
            info!(path = %path.display(), "[DRY RUN] Would remove");
            return Ok(false);
        }

        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let result = if meta.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if meta.is_dir() => {
                warn!(path = %path.display(), error = %e, "Directory not empty, leaving it");
                Ok(false)
            }
            Err(e) => Err(HardenError::RestoreFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }
}

/// Serialize a plan as a standalone POSIX shell script.
///
/// The script re-executes itself through sudo when unprivileged and finds
/// captured copies relative to its own location.
pub fn render_script(plan: &RestorePlan) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "#!/bin/sh");
    let _ = writeln!(s, "# harden restore for run {} ({})", plan.run_id, plan.created_at);
    let _ = writeln!(s, "set -eu");
    s.push_str(
        r#"
if [ "$(id -u)" -ne 0 ]; then
    exec sudo sh "$0" "$@"
fi

SNAPSHOT_DIR=$(cd "$(dirname "$0")" && pwd)

verify() {
    actual=$(sha256sum "$1" | cut -d' ' -f1)
    if [ "$actual" != "$2" ]; then
        echo "checksum mismatch: $1" >&2
        exit 1
    fi
}

restore_file() {
    tmp="$2.harden-restore.$$"
    mkdir -p "$(dirname "$2")"
    cp "$1" "$tmp"
    chmod "$3" "$tmp"
    chown "$4" "$tmp"
    mv -f "$tmp" "$2"
}

remove_path() {
    if [ -d "$1" ] && [ ! -L "$1" ]; then
        rmdir "$1" 2>/dev/null || echo "leaving non-empty directory $1" >&2
    else
        rm -f "$1"
    fi
}

"#,
    );

    for action in &plan.actions {
        if let RestoreAction::RestoreFile { backup, sha256, .. } = action {
            let _ = writeln!(
                s,
                "verify \"$SNAPSHOT_DIR\"/{} {}",
                shell_quote(&backup.display().to_string()),
                sha256
            );
        }
    }
    s.push('\n');

    for action in &plan.actions {
        let target = shell_quote(&host_path(&plan.root, action.path()).display().to_string());
        match action {
            RestoreAction::RestoreDir { mode, uid, gid, .. } => {
                let _ = writeln!(s, "mkdir -p {}", target);
                let _ = writeln!(s, "chmod {:o} {}", mode, target);
                let _ = writeln!(s, "chown {}:{} {}", uid, gid, target);
            }
            RestoreAction::RestoreFile {
                backup,
                mode,
                uid,
                gid,
                ..
            } => {
                let _ = writeln!(
                    s,
                    "restore_file \"$SNAPSHOT_DIR\"/{} {} {:o} {}:{}",
                    shell_quote(&backup.display().to_string()),
                    target,
                    mode,
                    uid,
                    gid
                );
            }
            RestoreAction::RestoreSymlink { target: link, .. } => {
                let _ = writeln!(
                    s,
                    "ln -sfn {} {}",
                    shell_quote(&link.display().to_string()),
                    target
                );
            }
            RestoreAction::Remove { .. } => {
                let _ = writeln!(s, "remove_path {}", target);
            }
        }
    }

    if !plan.service_commands.is_empty() {
        s.push('\n');
    }
    for command in &plan.service_commands {
        let line = command
            .argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(
            s,
            "{} || echo {} >&2",
            line,
            shell_quote(&format!("warning: '{}' failed", line))
        );
    }

    let _ = writeln!(s, "\necho \"restore of run {} complete\"", plan.run_id);
    s
}
