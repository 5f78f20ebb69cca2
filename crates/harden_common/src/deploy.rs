//! Atomic Deployer
//!
//! Stage-then-rename installs: content goes to a fresh temporary file in the
//! destination's own directory, gets its mode and owner, then replaces the
//! destination with a single rename. A failure at any step drops the
//! temporary file and leaves the destination untouched.

use nix::unistd::{chown, Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{HardenError, Result};

/// Numeric owner applied to installed files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOwner {
    pub uid: u32,
    pub gid: u32,
}

impl FileOwner {
    pub fn current() -> Self {
        Self {
            uid: Uid::effective().as_raw(),
            gid: Gid::effective().as_raw(),
        }
    }
}

/// Symbolic owner as declared by a configuration item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSpec {
    pub user: String,
    pub group: String,
}

impl OwnerSpec {
    pub fn new(user: &str, group: &str) -> Self {
        Self {
            user: user.to_string(),
            group: group.to_string(),
        }
    }

    pub fn root() -> Self {
        Self::new("root", "root")
    }

    /// Look up uid/gid. Numeric names are taken literally.
    pub fn resolve(&self) -> Result<FileOwner> {
        let uid = match self.user.parse::<u32>() {
            Ok(uid) => uid,
            Err(_) => User::from_name(&self.user)
                .map_err(|e| self.lookup_error("user", &self.user, e.to_string()))?
                .ok_or_else(|| self.lookup_error("user", &self.user, "no such user".to_string()))?
                .uid
                .as_raw(),
        };

        let gid = match self.group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => Group::from_name(&self.group)
                .map_err(|e| self.lookup_error("group", &self.group, e.to_string()))?
                .ok_or_else(|| {
                    self.lookup_error("group", &self.group, "no such group".to_string())
                })?
                .gid
                .as_raw(),
        };

        Ok(FileOwner { uid, gid })
    }

    fn lookup_error(&self, kind: &str, name: &str, message: String) -> HardenError {
        HardenError::InvalidConfig {
            message: format!("cannot resolve {} '{}': {}", kind, name, message),
        }
    }
}

impl std::fmt::Display for OwnerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user, self.group)
    }
}

/// Whether installs change file ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipPolicy {
    /// chown every installed file (privileged runs)
    Apply,
    /// Keep the invoking user's ownership (unprivileged sysroot runs)
    Skip,
}

impl OwnershipPolicy {
    pub fn for_current_process() -> Self {
        if Uid::effective().is_root() {
            OwnershipPolicy::Apply
        } else {
            OwnershipPolicy::Skip
        }
    }
}

#[derive(Debug, Clone)]
pub struct Deployer {
    dry_run: bool,
    ownership: OwnershipPolicy,
}

impl Deployer {
    pub fn new(dry_run: bool, ownership: OwnershipPolicy) -> Self {
        Self { dry_run, ownership }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Atomically install `content` at `dest` with `mode` and `owner`.
    pub fn install(
        &self,
        content: &[u8],
        dest: &Path,
        mode: u32,
        owner: Option<FileOwner>,
    ) -> Result<()> {
        if self.dry_run {
            info!(
                path = %dest.display(),
                mode = %format!("{:o}", mode),
                bytes = content.len(),
                "[DRY RUN] Would install"
            );
            return Ok(());
        }

        let fail = |message: String| HardenError::InstallFailed {
            path: dest.to_path_buf(),
            message,
        };

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| fail("destination has no parent directory".to_string()))?;
        fs::create_dir_all(parent)
            .map_err(|e| fail(format!("cannot create {}: {}", parent.display(), e)))?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // Dropped (and removed) on every early return below
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| fail(format!("cannot create temporary file: {}", e)))?;

        temp.write_all(content)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| fail(format!("cannot write temporary file: {}", e)))?;

        fs::set_permissions(temp.path(), Permissions::from_mode(mode))
            .map_err(|e| fail(format!("cannot set mode {:o}: {}", mode, e)))?;

        if let (OwnershipPolicy::Apply, Some(owner)) = (self.ownership, owner) {
            chown(
                temp.path(),
                Some(Uid::from_raw(owner.uid)),
                Some(Gid::from_raw(owner.gid)),
            )
            .map_err(|e| fail(format!("cannot chown to {}:{}: {}", owner.uid, owner.gid, e)))?;
        }

        temp.persist(dest)
            .map_err(|e| fail(format!("rename onto destination failed: {}", e.error)))?;

        sync_dir(parent);
        debug!(path = %dest.display(), mode = %format!("{:o}", mode), "Installed");
        Ok(())
    }

    /// Replace `dest` with an already-installed staged sibling.
    pub fn promote(&self, staged: &Path, dest: &Path) -> Result<()> {
        if self.dry_run {
            info!(path = %dest.display(), "[DRY RUN] Would promote staged configuration");
            return Ok(());
        }

        fs::rename(staged, dest).map_err(|e| HardenError::InstallFailed {
            path: dest.to_path_buf(),
            message: format!("cannot promote {}: {}", staged.display(), e),
        })?;

        if let Some(parent) = dest.parent() {
            sync_dir(parent);
        }
        Ok(())
    }

    /// Remove a staged sibling that will not be promoted.
    pub fn discard(&self, staged: &Path) {
        if self.dry_run {
            return;
        }
        match fs::remove_file(staged) {
            Ok(()) => debug!(path = %staged.display(), "Discarded staged file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %staged.display(), error = %e, "Failed to discard staged file"),
        }
    }

    /// Create a directory with the given mode and owner if it is missing.
    pub fn ensure_dir(&self, path: &Path, mode: u32, owner: Option<FileOwner>) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        let fail = |e: std::io::Error| HardenError::InstallFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        fs::create_dir_all(path).map_err(fail)?;
        fs::set_permissions(path, Permissions::from_mode(mode)).map_err(fail)?;

        if let (OwnershipPolicy::Apply, Some(owner)) = (self.ownership, owner) {
            chown(path, Some(Uid::from_raw(owner.uid)), Some(Gid::from_raw(owner.gid)))
                .map_err(|e| HardenError::InstallFailed {
                    path: path.to_path_buf(),
                    message: format!("cannot chown: {}", e),
                })?;
        }
        Ok(())
    }
}

/// Best-effort fsync of a directory so the rename is durable.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Leftover temporaries from an interrupted install in `dir`.
pub fn stray_temporaries(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .map(|n| {
                            let n = n.to_string_lossy();
                            n.starts_with('.') && n.ends_with(".tmp")
                        })
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default()
}
