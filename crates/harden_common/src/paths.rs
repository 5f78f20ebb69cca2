//! Path helpers shared by the deployer, snapshot manager and restore plan.
//!
//! Managed paths are always absolute host paths (`/etc/ssh/sshd_config`).
//! They are resolved under the run's root so the whole engine can operate on
//! a scratch sysroot.

use std::path::{Component, Path, PathBuf};

/// Suffix of a staged sibling awaiting validation
pub const STAGED_SUFFIX: &str = ".harden-staged";

/// Strip the leading `/` (and any `.`/`..`) from a managed path.
pub fn relative_to_root(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Resolve a managed path under `root`.
pub fn host_path(root: &Path, path: &Path) -> PathBuf {
    root.join(relative_to_root(path))
}

/// The staged sibling of `dest`, in the same directory.
pub fn staged_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(STAGED_SUFFIX);
    dest.with_file_name(name)
}

/// Single-quote a string for POSIX sh.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_path_under_root() {
        let root = Path::new("/tmp/sysroot");
        assert_eq!(
            host_path(root, Path::new("/etc/ssh/sshd_config")),
            PathBuf::from("/tmp/sysroot/etc/ssh/sshd_config")
        );
        assert_eq!(
            host_path(Path::new("/"), Path::new("/etc/sysctl.d/60-harden.conf")),
            PathBuf::from("/etc/sysctl.d/60-harden.conf")
        );
    }

    #[test]
    fn test_relative_drops_parent_components() {
        assert_eq!(
            relative_to_root(Path::new("/etc/../etc/issue.net")),
            PathBuf::from("etc/etc/issue.net")
        );
    }

    #[test]
    fn test_staged_path_is_sibling() {
        let staged = staged_path(Path::new("/etc/ssh/sshd_config"));
        assert_eq!(staged, PathBuf::from("/etc/ssh/sshd_config.harden-staged"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/ssh/sshd_config"), "/etc/ssh/sshd_config");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
