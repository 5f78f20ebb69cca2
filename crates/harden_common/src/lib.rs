//! Harden Common - configuration transaction engine for host hardening.
//!
//! Snapshot first, then render, install, validate and activate each profile
//! group, then cut the remote-access daemon over without locking the
//! operator out.

pub mod catalog;
pub mod config;
pub mod context;
pub mod cutover;
pub mod deploy;
pub mod error;
pub mod logging;
pub mod paths;
pub mod profile;
pub mod restore;
pub mod runner;
pub mod session;
pub mod snapshot;
pub mod subsystem;
pub mod template;
pub mod transaction;

pub use config::Config;
pub use context::{ItemResult, Outcome, RunContext};
pub use cutover::{CutoverReport, CutoverState, RemoteAccessService, SshService};
pub use error::{HardenError, Result};
pub use profile::{resolve, ConfigGroup, ConfigurationItem, Profile};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ScratchRootRunner, SystemRunner};
pub use session::SessionOverride;
pub use snapshot::{list_snapshots, RunManifest, Snapshot};
pub use subsystem::{Mode, Subsystem};
pub use transaction::{RunRequest, RunSummary, Transaction};
