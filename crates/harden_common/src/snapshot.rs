//! Snapshot Manager
//!
//! Captures the pre-run state of every managed path into a timestamped
//! backup area and finalizes it into a restore plan before the first
//! install. Layout of one backup area:
//!
//! ```text
//! <backup_root>/<YYYYmmdd-HHMMSS>[-N]/
//!     backup/<path relative to root>   captured copies
//!     restore.json                     RestorePlan
//!     restore.sh                       same plan as a shell script
//!     manifest.json                    RunManifest
//! ```
//!
//! A finalized snapshot is never written again by this process.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, DirBuilder, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{HardenError, Result};
use crate::paths::{host_path, relative_to_root};
use crate::restore::{digest, render_script, RestoreAction, RestorePlan, ServiceCommand};

pub const BACKUP_DIR: &str = "backup";
pub const RESTORE_PLAN_FILE: &str = "restore.json";
pub const RESTORE_SCRIPT_FILE: &str = "restore.sh";
pub const MANIFEST_FILE: &str = "manifest.json";

/// How many `-N` suffixes to try when a timestamp is already taken
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Run environment recorded next to the captured files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub created_at: String,
    pub tool_version: String,
    pub profile: String,
    pub port: u16,
    pub modes: Vec<String>,
    pub dry_run: bool,
    pub lockout_hazard: bool,
    pub root: PathBuf,
}

impl RunManifest {
    pub fn new(profile: &str, port: u16, modes: Vec<String>, dry_run: bool, lockout_hazard: bool, root: &Path) -> Self {
        Self {
            run_id: String::new(),
            created_at: Utc::now().to_rfc3339(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            profile: profile.to_string(),
            port,
            modes,
            dry_run,
            lockout_hazard,
            root: root.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CapturedEntry {
    File {
        backup: PathBuf,
        mode: u32,
        uid: u32,
        gid: u32,
        sha256: String,
    },
    Directory {
        mode: u32,
        uid: u32,
        gid: u32,
    },
    Symlink {
        target: PathBuf,
    },
    Absent,
}

/// An open snapshot accepting captures
pub struct SnapshotManager {
    dir: PathBuf,
    root: PathBuf,
    manifest: RunManifest,
    entries: BTreeMap<PathBuf, CapturedEntry>,
    dry_run: bool,
}

impl SnapshotManager {
    /// Create the backup area. Must happen before anything else touches the host.
    pub fn begin(backup_root: &Path, root: &Path, mut manifest: RunManifest, dry_run: bool) -> Result<Self> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();

        let dir = if dry_run {
            info!(path = %backup_root.join(&stamp).display(), "[DRY RUN] Would create backup area");
            backup_root.join(&stamp)
        } else {
            create_unique_dir(backup_root, &stamp)?
        };

        manifest.run_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(stamp);

        if !dry_run {
            create_private_dir(&dir.join(BACKUP_DIR))?;
            info!(path = %dir.display(), "Backup area created");
        }

        Ok(Self {
            dir,
            root: root.to_path_buf(),
            manifest,
            entries: BTreeMap::new(),
            dry_run,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_id(&self) -> &str {
        &self.manifest.run_id
    }

    pub fn is_captured(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Record the current state of a managed path. Capturing a path twice is
    /// a no-op. Directories are captured recursively; for an absent path
    /// every missing ancestor is captured too, so restore also removes
    /// directories the run created.
    pub fn capture(&mut self, path: &Path) -> Result<()> {
        if self.entries.contains_key(path) {
            return Ok(());
        }

        let host = host_path(&self.root, path);
        let meta = match fs::symlink_metadata(&host) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Captured as absent");
                self.entries.insert(path.to_path_buf(), CapturedEntry::Absent);
                if let Some(parent) = path.parent() {
                    if parent.parent().is_some() && !host_path(&self.root, parent).exists() {
                        self.capture(parent)?;
                    }
                }
                return Ok(());
            }
            Err(e) => return Err(self.capture_error(path, e)),
        };

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&host).map_err(|e| self.capture_error(path, e))?;
            self.entries
                .insert(path.to_path_buf(), CapturedEntry::Symlink { target });
        } else if meta.is_dir() {
            self.entries.insert(
                path.to_path_buf(),
                CapturedEntry::Directory {
                    mode: meta.mode() & 0o7777,
                    uid: meta.uid(),
                    gid: meta.gid(),
                },
            );

            for entry in WalkDir::new(&host).min_depth(1).follow_links(false) {
                let entry = entry.map_err(|e| HardenError::Snapshot {
                    message: format!("cannot walk {}: {}", host.display(), e),
                })?;
                let relative = entry
                    .path()
                    .strip_prefix(&host)
                    .map_err(|e| HardenError::Snapshot {
                        message: e.to_string(),
                    })?;
                self.capture(&path.join(relative))?;
            }
        } else {
            let bytes = fs::read(&host).map_err(|e| self.capture_error(path, e))?;
            let backup = Path::new(BACKUP_DIR).join(relative_to_root(path));

            if !self.dry_run {
                let copy = self.dir.join(&backup);
                if let Some(parent) = copy.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&copy, &bytes).map_err(|e| self.capture_error(path, e))?;
                fs::set_permissions(&copy, Permissions::from_mode(0o600))?;
            }

            self.entries.insert(
                path.to_path_buf(),
                CapturedEntry::File {
                    backup,
                    mode: meta.mode() & 0o7777,
                    uid: meta.uid(),
                    gid: meta.gid(),
                    sha256: digest(&bytes),
                },
            );
        }

        debug!(path = %path.display(), "Captured");
        Ok(())
    }

    fn capture_error(&self, path: &Path, e: std::io::Error) -> HardenError {
        HardenError::Snapshot {
            message: format!("cannot capture {}: {}", path.display(), e),
        }
    }

    /// Write the restore plan, its script form and the manifest, closing the
    /// snapshot to further captures.
    pub fn finalize(self, service_commands: Vec<ServiceCommand>) -> Result<Snapshot> {
        let actions = self
            .entries
            .iter()
            .map(|(path, entry)| {
                let path = path.clone();
                match entry.clone() {
                    CapturedEntry::File {
                        backup,
                        mode,
                        uid,
                        gid,
                        sha256,
                    } => RestoreAction::RestoreFile {
                        path,
                        backup,
                        mode,
                        uid,
                        gid,
                        sha256,
                    },
                    CapturedEntry::Directory { mode, uid, gid } => {
                        RestoreAction::RestoreDir { path, mode, uid, gid }
                    }
                    CapturedEntry::Symlink { target } => {
                        RestoreAction::RestoreSymlink { path, target }
                    }
                    CapturedEntry::Absent => RestoreAction::Remove { path },
                }
            })
            .collect();

        let plan = RestorePlan::new(
            &self.manifest.run_id,
            &self.manifest.created_at,
            &self.root,
            actions,
            service_commands,
        );

        let snapshot = Snapshot {
            dir: self.dir,
            manifest: self.manifest,
            plan,
        };

        if self.dry_run {
            info!(
                actions = snapshot.plan.actions.len(),
                "[DRY RUN] Would write restore plan"
            );
            return Ok(snapshot);
        }

        write_json(&snapshot.restore_plan_path(), &snapshot.plan)?;
        write_json(&snapshot.dir.join(MANIFEST_FILE), &snapshot.manifest)?;

        let script = snapshot.restore_script_path();
        fs::write(&script, render_script(&snapshot.plan))?;
        fs::set_permissions(&script, Permissions::from_mode(0o700))?;

        info!(
            path = %snapshot.dir.display(),
            actions = snapshot.plan.actions.len(),
            "Snapshot finalized"
        );
        Ok(snapshot)
    }
}

/// A finalized, read-only snapshot
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dir: PathBuf,
    pub manifest: RunManifest,
    pub plan: RestorePlan,
}

impl Snapshot {
    pub fn load(dir: &Path) -> Result<Self> {
        let plan = RestorePlan::load(&dir.join(RESTORE_PLAN_FILE))?;
        let manifest = read_manifest(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            plan,
        })
    }

    pub fn restore_plan_path(&self) -> PathBuf {
        self.dir.join(RESTORE_PLAN_FILE)
    }

    pub fn restore_script_path(&self) -> PathBuf {
        self.dir.join(RESTORE_SCRIPT_FILE)
    }
}

fn read_manifest(dir: &Path) -> Result<RunManifest> {
    let contents = fs::read_to_string(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Backup areas under `backup_root` with their manifests, newest first.
/// Directories without a readable manifest are skipped.
pub fn list_snapshots(backup_root: &Path) -> Result<Vec<(PathBuf, RunManifest)>> {
    let entries = match fs::read_dir(backup_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match read_manifest(&path) {
            Ok(manifest) => found.push((path, manifest)),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable backup area"),
        }
    }

    found.sort_by(|a, b| b.0.file_name().cmp(&a.0.file_name()));
    Ok(found)
}

fn create_private_dir(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|e| HardenError::Snapshot {
            message: format!("cannot create {}: {}", path.display(), e),
        })
}

/// `<root>/<stamp>`, or `<root>/<stamp>-N` when runs share a second.
fn create_unique_dir(backup_root: &Path, stamp: &str) -> Result<PathBuf> {
    create_private_dir(backup_root)?;

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            stamp.to_string()
        } else {
            format!("{}-{}", stamp, attempt)
        };
        let dir = backup_root.join(name);
        match DirBuilder::new().mode(0o700).create(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(HardenError::Snapshot {
                    message: format!("cannot create {}: {}", dir.display(), e),
                })
            }
        }
    }

    Err(HardenError::Snapshot {
        message: format!("no free backup directory name for {}", stamp),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(root: &Path) -> RunManifest {
        RunManifest::new("standard", 2222, vec!["all".to_string()], false, false, root)
    }

    #[test]
    fn test_capture_file_dir_and_absent() {
        let root = tempdir().unwrap();
        let backups = tempdir().unwrap();
        fs::create_dir_all(root.path().join("etc/ssh")).unwrap();
        fs::write(root.path().join("etc/ssh/sshd_config"), "Port 22\n").unwrap();
        fs::set_permissions(
            root.path().join("etc/ssh/sshd_config"),
            Permissions::from_mode(0o640),
        )
        .unwrap();

        let mut manager =
            SnapshotManager::begin(backups.path(), root.path(), manifest(root.path()), false).unwrap();
        manager.capture(Path::new("/etc/ssh")).unwrap();
        manager.capture(Path::new("/etc/fail2ban/jail.d/harden.local")).unwrap();

        assert!(manager.is_captured(Path::new("/etc/ssh/sshd_config")));
        // Missing ancestors are recorded so restore can remove them
        assert!(manager.is_captured(Path::new("/etc/fail2ban/jail.d")));
        assert!(manager.is_captured(Path::new("/etc/fail2ban")));
        assert!(!manager.is_captured(Path::new("/etc")));

        let copy = manager.dir().join("backup/etc/ssh/sshd_config");
        assert_eq!(fs::read_to_string(copy).unwrap(), "Port 22\n");

        let snapshot = manager.finalize(Vec::new()).unwrap();
        let file = snapshot
            .plan
            .actions
            .iter()
            .find(|a| a.path() == Path::new("/etc/ssh/sshd_config"))
            .unwrap();
        match file {
            RestoreAction::RestoreFile { mode, sha256, .. } => {
                assert_eq!(*mode, 0o640);
                assert_eq!(*sha256, digest(b"Port 22\n"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_capture_is_idempotent() {
        let root = tempdir().unwrap();
        let backups = tempdir().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/issue.net"), "before\n").unwrap();

        let mut manager =
            SnapshotManager::begin(backups.path(), root.path(), manifest(root.path()), false).unwrap();
        manager.capture(Path::new("/etc/issue.net")).unwrap();

        // A later change must not overwrite the first capture
        fs::write(root.path().join("etc/issue.net"), "after\n").unwrap();
        manager.capture(Path::new("/etc/issue.net")).unwrap();

        let snapshot = manager.finalize(Vec::new()).unwrap();
        assert_eq!(snapshot.plan.actions.len(), 1);
        let copy = snapshot.dir.join("backup/etc/issue.net");
        assert_eq!(fs::read_to_string(copy).unwrap(), "before\n");
    }

    #[test]
    fn test_finalize_writes_artifacts() {
        let root = tempdir().unwrap();
        let backups = tempdir().unwrap();

        let mut manager =
            SnapshotManager::begin(backups.path(), root.path(), manifest(root.path()), false).unwrap();
        manager.capture(Path::new("/etc/issue.net")).unwrap();
        let snapshot = manager.finalize(Vec::new()).unwrap();

        assert!(snapshot.restore_plan_path().is_file());
        assert!(snapshot.dir.join(MANIFEST_FILE).is_file());
        let mode = fs::metadata(snapshot.restore_script_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);

        let loaded = Snapshot::load(&snapshot.dir).unwrap();
        assert_eq!(loaded.plan, snapshot.plan);
        assert_eq!(loaded.manifest.port, 2222);
        assert_eq!(loaded.manifest.run_id, snapshot.manifest.run_id);
    }

    #[test]
    fn test_same_second_runs_get_distinct_dirs() {
        let root = tempdir().unwrap();
        let backups = tempdir().unwrap();

        let first = create_unique_dir(backups.path(), "20260101-120000").unwrap();
        let second = create_unique_dir(backups.path(), "20260101-120000").unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("20260101-120000-1"));

        let manager =
            SnapshotManager::begin(backups.path(), root.path(), manifest(root.path()), false).unwrap();
        assert_eq!(
            manager.run_id(),
            manager.dir().file_name().unwrap().to_string_lossy()
        );
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let root = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let backup_root = backups.path().join("harden");
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/issue.net"), "x").unwrap();

        let mut manager =
            SnapshotManager::begin(&backup_root, root.path(), manifest(root.path()), true).unwrap();
        manager.capture(Path::new("/etc/issue.net")).unwrap();
        let snapshot = manager.finalize(Vec::new()).unwrap();

        assert!(!backup_root.exists());
        assert_eq!(snapshot.plan.actions.len(), 1);
    }

    #[test]
    fn test_list_snapshots_newest_first() {
        let root = tempdir().unwrap();
        let backups = tempdir().unwrap();

        for stamp in ["20260101-000000", "20260301-000000"] {
            let dir = backups.path().join(stamp);
            fs::create_dir_all(&dir).unwrap();
            let mut m = manifest(root.path());
            m.run_id = stamp.to_string();
            write_json(&dir.join(MANIFEST_FILE), &m).unwrap();
        }
        fs::create_dir_all(backups.path().join("not-a-snapshot")).unwrap();

        let listed = list_snapshots(backups.path()).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].1.run_id, "20260301-000000");
        assert!(list_snapshots(&backups.path().join("missing")).unwrap().is_empty());
    }
}
