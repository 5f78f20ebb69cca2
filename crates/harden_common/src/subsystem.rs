//! Subsystems the engine can reconfigure
//!
//! Each subsystem knows how to test a configuration without applying it and
//! which command makes a committed configuration take effect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::config::SshConfig;
use crate::error::HardenError;
use crate::runner::CommandSpec;

/// Token replaced with the staged file path in staged validation commands
pub const FILE_TOKEN: &str = "{file}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subsystem {
    Kernel,
    RemoteAccess,
    IntrusionPrevention,
    Banner,
    AccessControl,
    Container,
    WebServer,
}

/// How a subsystem tests configuration before it is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationSpec {
    /// Nothing to test; install is the commit
    None,
    /// Run against the staged sibling before promotion
    StagedCommand(Vec<String>),
    /// Run against the installed tree; failure blocks the restart only
    InstalledCommand(Vec<String>),
    /// Every key must exist under /proc/sys; checked before any write
    KernelParameters,
    /// Delegated to the connection-safety coordinator
    RemoteAccess,
}

impl ValidationSpec {
    pub fn uses_staging(&self) -> bool {
        matches!(
            self,
            ValidationSpec::StagedCommand(_) | ValidationSpec::RemoteAccess
        )
    }
}

impl Subsystem {
    pub const ALL: [Subsystem; 7] = [
        Subsystem::Kernel,
        Subsystem::RemoteAccess,
        Subsystem::IntrusionPrevention,
        Subsystem::Banner,
        Subsystem::AccessControl,
        Subsystem::Container,
        Subsystem::WebServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Kernel => "kernel",
            Subsystem::RemoteAccess => "ssh",
            Subsystem::IntrusionPrevention => "fail2ban",
            Subsystem::Banner => "banner",
            Subsystem::AccessControl => "apparmor",
            Subsystem::Container => "docker",
            Subsystem::WebServer => "nginx",
        }
    }

    pub fn validation(&self) -> ValidationSpec {
        let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            Subsystem::Kernel => ValidationSpec::KernelParameters,
            Subsystem::RemoteAccess => ValidationSpec::RemoteAccess,
            Subsystem::IntrusionPrevention => {
                ValidationSpec::InstalledCommand(argv(&["fail2ban-client", "-t"]))
            }
            Subsystem::Banner => ValidationSpec::None,
            Subsystem::AccessControl => ValidationSpec::StagedCommand(argv(&[
                "apparmor_parser",
                "--skip-kernel-load",
                "--skip-cache",
                FILE_TOKEN,
            ])),
            Subsystem::Container => ValidationSpec::StagedCommand(argv(&[
                "dockerd",
                "--validate",
                "--config-file",
                FILE_TOKEN,
            ])),
            Subsystem::WebServer => ValidationSpec::InstalledCommand(argv(&["nginx", "-t"])),
        }
    }

    /// Command that makes committed configuration live, if any.
    pub fn service_action(&self, ssh: &SshConfig) -> Option<CommandSpec> {
        match self {
            Subsystem::Kernel => Some(CommandSpec::new("sysctl").arg("--system")),
            Subsystem::RemoteAccess => {
                Some(CommandSpec::new("systemctl").args(["restart", ssh.service.as_str()]))
            }
            Subsystem::IntrusionPrevention => {
                Some(CommandSpec::new("systemctl").args(["restart", "fail2ban"]))
            }
            Subsystem::Banner => None,
            Subsystem::AccessControl => {
                Some(CommandSpec::new("systemctl").args(["reload", "apparmor"]))
            }
            Subsystem::Container => Some(CommandSpec::new("systemctl").args(["restart", "docker"])),
            Subsystem::WebServer => Some(CommandSpec::new("systemctl").args(["reload", "nginx"])),
        }
    }

    /// Restart order used by restore: local services first, the remote
    /// access daemon always last.
    pub fn restart_rank(&self) -> u8 {
        match self {
            Subsystem::Kernel => 0,
            Subsystem::Banner => 1,
            Subsystem::AccessControl => 2,
            Subsystem::Container => 3,
            Subsystem::WebServer => 4,
            Subsystem::IntrusionPrevention => 5,
            Subsystem::RemoteAccess => u8::MAX,
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which subsystems participate in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    All,
    Ssh,
    Kernel,
    Intrusion,
    Mac,
    Container,
    Web,
    Banner,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::All => "all",
            Mode::Ssh => "ssh",
            Mode::Kernel => "kernel",
            Mode::Intrusion => "intrusion",
            Mode::Mac => "mac",
            Mode::Container => "container",
            Mode::Web => "web",
            Mode::Banner => "banner",
        }
    }

    pub fn subsystems(&self) -> Vec<Subsystem> {
        match self {
            Mode::All => Subsystem::ALL.to_vec(),
            Mode::Ssh => vec![Subsystem::RemoteAccess],
            Mode::Kernel => vec![Subsystem::Kernel],
            Mode::Intrusion => vec![Subsystem::IntrusionPrevention],
            Mode::Mac => vec![Subsystem::AccessControl],
            Mode::Container => vec![Subsystem::Container],
            Mode::Web => vec![Subsystem::WebServer],
            Mode::Banner => vec![Subsystem::Banner],
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = HardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" | "full" => Ok(Mode::All),
            "ssh" => Ok(Mode::Ssh),
            "kernel" | "sysctl" => Ok(Mode::Kernel),
            "intrusion" | "fail2ban" => Ok(Mode::Intrusion),
            "mac" | "apparmor" => Ok(Mode::Mac),
            "container" | "docker" => Ok(Mode::Container),
            "web" | "nginx" => Ok(Mode::Web),
            "banner" => Ok(Mode::Banner),
            other => Err(HardenError::InvalidArgument {
                message: format!("unknown mode '{}'", other),
            }),
        }
    }
}

/// Union of the subsystems selected by `modes`; empty selects everything.
pub fn selected_subsystems(modes: &[Mode]) -> BTreeSet<Subsystem> {
    if modes.is_empty() {
        return Subsystem::ALL.into_iter().collect();
    }
    modes.iter().flat_map(|m| m.subsystems()).collect()
}

/// Substitute the staged file into a validation command.
pub fn validation_command(argv: &[String], file: &Path) -> Option<CommandSpec> {
    let file = file.display().to_string();
    let mut parts = argv.iter().map(|a| a.replace(FILE_TOKEN, &file));
    let program = parts.next()?;
    Some(CommandSpec::new(program).args(parts))
}

/// Check a kernel parameter file without applying it.
///
/// Every `key = value` line must name an existing entry under `proc_sys`.
/// Lines prefixed with `-` are allowed to be absent, matching sysctl.
pub fn check_kernel_parameters(proc_sys: &Path, content: &str) -> Result<(), String> {
    let mut problems = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let (optional, line) = match line.strip_prefix('-') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, line),
        };

        let Some((key, value)) = line.split_once('=') else {
            problems.push(format!("line {}: expected 'key = value': {}", index + 1, raw));
            continue;
        };

        let key = key.trim();
        if key.is_empty() || value.trim().is_empty() {
            problems.push(format!("line {}: empty key or value", index + 1));
            continue;
        }

        let entry = proc_sys.join(key.replace('.', "/"));
        if !optional && !entry.exists() {
            problems.push(format!("line {}: unknown key {}", index + 1, key));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("\n"))
    }
}
