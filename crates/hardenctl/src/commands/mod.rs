//! Command modules for hardenctl
//!
//! - apply: run a profile against the host
//! - plan: resolve a profile without side effects
//! - rollback: restore a snapshot
//! - snapshots: list backup areas
//! - config: print the effective configuration

pub mod apply;
pub mod config;
pub mod plan;
pub mod rollback;
pub mod snapshots;

use harden_common::HardenError;
use nix::unistd::Uid;
use std::path::Path;

/// A filesystem root other than the live host's
pub fn is_scratch_root(root: &Path) -> bool {
    root != Path::new("/")
}

/// Mutating commands need root, unless nothing is written or they target a
/// scratch root.
pub fn require_root(action: &str, dry_run: bool, root: &Path) -> Result<(), HardenError> {
    if dry_run || is_scratch_root(root) || Uid::effective().is_root() {
        return Ok(());
    }
    Err(HardenError::PrivilegeRequired {
        message: format!(
            "'{}' modifies system configuration; run with sudo or add --dry-run",
            action
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_and_scratch_root_need_no_privilege() {
        assert!(require_root("apply", true, Path::new("/")).is_ok());
        assert!(require_root("apply", false, Path::new("/tmp/sysroot")).is_ok());
    }

    #[test]
    fn test_scratch_root_detection() {
        assert!(!is_scratch_root(Path::new("/")));
        assert!(is_scratch_root(Path::new("/tmp/sysroot")));
    }

    #[test]
    fn test_real_root_needs_privilege() {
        let result = require_root("apply", false, Path::new("/"));
        if Uid::effective().is_root() {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(HardenError::PrivilegeRequired { .. })));
        }
    }
}
