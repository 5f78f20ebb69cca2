//! Shared fixtures: a scratch sysroot, a recording command runner and a
//! scripted remote-access daemon.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use harden_common::catalog::builtin_template;
use harden_common::config::Config;
use harden_common::cutover::RestartReport;
use harden_common::paths::STAGED_SUFFIX;
use harden_common::{
    CommandOutput, CommandRunner, CommandSpec, HardenError, RemoteAccessService, Result,
};
use tempfile::TempDir;
use walkdir::WalkDir;

pub const ORIGINAL_SSHD: &str = "Port 22\nPermitRootLogin yes\n";

/// Temporary host with an existing sshd configuration
pub struct Sysroot {
    pub dir: TempDir,
}

impl Sysroot {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sysroot = Self { dir };
        sysroot.write("/etc/ssh/sshd_config", ORIGINAL_SSHD, 0o644);
        populate_proc_sys(&sysroot.root());
        sysroot
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    pub fn backups(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub fn templates(&self) -> PathBuf {
        self.dir.path().join("templates")
    }

    pub fn host(&self, path: &str) -> PathBuf {
        self.root().join(path.trim_start_matches('/'))
    }

    pub fn write(&self, path: &str, content: &str, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        let host = self.host(path);
        fs::create_dir_all(host.parent().unwrap()).unwrap();
        fs::write(&host, content).unwrap();
        fs::set_permissions(&host, fs::Permissions::from_mode(mode)).unwrap();
    }

    pub fn read(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.host(path)).ok()
    }

    pub fn mode(&self, path: &str) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(self.host(path)).unwrap().permissions().mode() & 0o7777
    }

    pub fn override_template(&self, id: &str, text: &str) {
        fs::create_dir_all(self.templates()).unwrap();
        fs::write(self.templates().join(format!("{}.tmpl", id)), text).unwrap();
    }

    pub fn config(&self) -> Config {
        let mut config = Config {
            root: self.root(),
            backup_root: self.backups(),
            template_dir: Some(self.templates()),
            log_file: self.dir.path().join("runs.jsonl"),
            ..Config::default()
        };
        config.ssh.countdown_secs = 3;
        config
    }

    /// Staged siblings left anywhere under the root
    pub fn staged_leftovers(&self) -> Vec<PathBuf> {
        WalkDir::new(self.root())
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.to_string_lossy().ends_with(STAGED_SUFFIX))
            .collect()
    }
}

pub const TICK: Duration = Duration::from_millis(1);

/// Create a `/proc/sys` entry for every mandatory key in the built-in
/// kernel parameter templates.
pub fn populate_proc_sys(root: &Path) {
    for id in ["sysctl-base", "sysctl-network", "sysctl-strict"] {
        let text = builtin_template(id).unwrap();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
                continue;
            }
            let key = line.split('=').next().unwrap().trim();
            let entry = root.join("proc/sys").join(key.replace('.', "/"));
            fs::create_dir_all(entry.parent().unwrap()).unwrap();
            fs::write(entry, "0\n").unwrap();
        }
    }
}

/// Records every command; commands starting with a configured prefix get a
/// scripted failure, everything else succeeds.
#[derive(Default)]
pub struct FakeRunner {
    calls: RefCell<Vec<String>>,
    failures: RefCell<Vec<(String, CommandOutput)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, prefix: &str, stderr: &str) {
        self.failures
            .borrow_mut()
            .push((prefix.to_string(), CommandOutput::failed(1, stderr)));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.borrow().iter().any(|c| c.starts_with(prefix))
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.to_string();
        self.calls.borrow_mut().push(line.clone());
        for (prefix, output) in self.failures.borrow().iter() {
            if line.starts_with(prefix.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput::ok(""))
    }
}

/// Scripted remote-access daemon
pub struct FakeService {
    ports_before: Vec<u16>,
    ports_after: Vec<u16>,
    syntax_ok: bool,
    restart_active: bool,
    restart_spawns: bool,
    restarted: Cell<bool>,
    pub restarts: RefCell<Vec<bool>>,
    pub tested: RefCell<Vec<PathBuf>>,
    pub probes: Cell<usize>,
}

impl FakeService {
    /// Listening on `before` until restarted, on `after` afterwards.
    pub fn new(before: &[u16], after: &[u16]) -> Self {
        Self {
            ports_before: before.to_vec(),
            ports_after: after.to_vec(),
            syntax_ok: true,
            restart_active: true,
            restart_spawns: true,
            restarted: Cell::new(false),
            restarts: RefCell::new(Vec::new()),
            tested: RefCell::new(Vec::new()),
            probes: Cell::new(0),
        }
    }

    pub fn rejecting_syntax(mut self) -> Self {
        self.syntax_ok = false;
        self
    }

    /// `restart` cannot even be started, as when systemctl is missing.
    pub fn failing_restart(mut self) -> Self {
        self.restart_spawns = false;
        self
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.borrow().len()
    }
}

impl RemoteAccessService for FakeService {
    async fn test_config(&self, config: &Path) -> Result<CommandOutput> {
        self.tested.borrow_mut().push(config.to_path_buf());
        if self.syntax_ok {
            Ok(CommandOutput::ok(""))
        } else {
            Ok(CommandOutput::failed(255, "line 3: Bad configuration option: Prot"))
        }
    }

    async fn restart(&self, release_socket: bool) -> Result<RestartReport> {
        self.restarts.borrow_mut().push(release_socket);
        if !self.restart_spawns {
            return Err(HardenError::CommandFailed {
                command: "systemctl restart ssh".to_string(),
                message: "No such file or directory".to_string(),
            });
        }
        self.restarted.set(true);
        let output = if self.restart_active {
            CommandOutput::ok("")
        } else {
            CommandOutput::failed(1, "Job for ssh.service failed")
        };
        Ok(RestartReport {
            output,
            active: self.restart_active,
        })
    }

    async fn listening_ports(&self) -> Result<Vec<u16>> {
        self.probes.set(self.probes.get() + 1);
        if self.restarted.get() {
            Ok(self.ports_after.clone())
        } else {
            Ok(self.ports_before.clone())
        }
    }

    fn configured_ports(&self) -> Vec<u16> {
        self.ports_before.clone()
    }
}
