//! Detect whether the invoking session is carried by the remote-access daemon.
//!
//! Computed once when the run context is built.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::HardenError;

const SESSION_VARS: [&str; 3] = ["SSH_CONNECTION", "SSH_CLIENT", "SSH_TTY"];

/// Cap on ancestry walks, in case /proc is inconsistent
const MAX_ANCESTRY_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOverride {
    #[default]
    Auto,
    Remote,
    Local,
}

impl FromStr for SessionOverride {
    type Err = HardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(SessionOverride::Auto),
            "remote" => Ok(SessionOverride::Remote),
            "local" => Ok(SessionOverride::Local),
            other => Err(HardenError::InvalidArgument {
                message: format!("unknown session kind '{}' (auto, remote, local)", other),
            }),
        }
    }
}

/// True when the current session depends on the daemon being reconfigured.
pub fn lockout_hazard(session: SessionOverride, daemon: &str) -> bool {
    match session {
        SessionOverride::Remote => true,
        SessionOverride::Local => false,
        SessionOverride::Auto => {
            let env = session_from_env(|name| std::env::var_os(name).is_some());
            let ancestry = env || daemon_in_ancestry(Path::new("/proc"), std::process::id(), daemon);
            debug!(env, ancestry, "Session detection");
            ancestry
        }
    }
}

fn session_from_env(is_set: impl Fn(&str) -> bool) -> bool {
    SESSION_VARS.iter().any(|name| is_set(name))
}

/// Walk parent pids under `proc` looking for a process named `daemon`.
pub fn daemon_in_ancestry(proc: &Path, pid: u32, daemon: &str) -> bool {
    let mut current = pid;
    for _ in 0..MAX_ANCESTRY_DEPTH {
        let Some((comm, ppid)) = read_stat(proc, current) else {
            return false;
        };
        // sshd on newer OpenSSH forks sshd-session per connection
        if comm == daemon || comm.starts_with(&format!("{}-", daemon)) {
            return true;
        }
        if ppid <= 1 || ppid == current {
            return false;
        }
        current = ppid;
    }
    false
}

/// (comm, ppid) from `/proc/<pid>/stat`. The comm field may contain spaces
/// and parentheses, so it is delimited by the last `)`.
fn read_stat(proc: &Path, pid: u32) -> Option<(String, u32)> {
    let stat = fs::read_to_string(proc.join(pid.to_string()).join("stat")).ok()?;
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let _state = rest.next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some((comm, ppid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_proc(entries: &[(u32, &str, u32)]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for (pid, comm, ppid) in entries {
            let pdir = dir.path().join(pid.to_string());
            fs::create_dir_all(&pdir).unwrap();
            fs::write(
                pdir.join("stat"),
                format!("{} ({}) S {} 1 1 0 -1", pid, comm, ppid),
            )
            .unwrap();
        }
        dir
    }

    #[test]
    fn test_ancestry_finds_daemon() {
        let proc = fake_proc(&[
            (500, "hardenctl", 400),
            (400, "bash", 300),
            (300, "sshd", 1),
        ]);
        assert!(daemon_in_ancestry(proc.path(), 500, "sshd"));
    }

    #[test]
    fn test_ancestry_matches_session_helper() {
        let proc = fake_proc(&[(500, "sudo", 450), (450, "sshd-session", 1)]);
        assert!(daemon_in_ancestry(proc.path(), 500, "sshd"));
    }

    #[test]
    fn test_local_console_is_not_hazardous() {
        let proc = fake_proc(&[
            (500, "hardenctl", 400),
            (400, "weird ) name", 300),
            (300, "login", 1),
        ]);
        assert!(!daemon_in_ancestry(proc.path(), 500, "sshd"));
        assert!(!daemon_in_ancestry(proc.path(), 999, "sshd"));
    }

    #[test]
    fn test_env_detection() {
        assert!(session_from_env(|name| name == "SSH_TTY"));
        assert!(!session_from_env(|_| false));
    }

    #[test]
    fn test_overrides_skip_detection() {
        assert!(lockout_hazard(SessionOverride::Remote, "sshd"));
        assert!(!lockout_hazard(SessionOverride::Local, "sshd"));
        assert!("bogus".parse::<SessionOverride>().is_err());
        assert_eq!("remote".parse::<SessionOverride>().unwrap(), SessionOverride::Remote);
    }
}
