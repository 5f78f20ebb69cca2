//! Rollback command

use anyhow::{Context, Result};
use chrono::Utc;
use harden_common::deploy::{Deployer, OwnershipPolicy};
use harden_common::logging::RunLogEntry;
use harden_common::restore::{RestoreExecutor, RestorePlan, RestoreReport};
use harden_common::{CommandRunner, Config, ScratchRootRunner, Snapshot, SystemRunner};
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{is_scratch_root, require_root};
use crate::output;

/// A backup directory path, or a run id under the backup root.
fn locate(config: &Config, snapshot: &Path) -> PathBuf {
    if snapshot.is_dir() {
        snapshot.to_path_buf()
    } else {
        config.backup_root.join(snapshot)
    }
}

pub async fn run(config: &Config, snapshot: &Path, dry_run: bool) -> Result<i32> {
    let dir = locate(config, snapshot);
    let snapshot = Snapshot::load(&dir)
        .with_context(|| format!("Cannot load snapshot from {}", dir.display()))?;

    require_root("rollback", dry_run, &snapshot.plan.root)?;
    output::display_restore_plan(&snapshot, dry_run);

    let started = Instant::now();
    let system = SystemRunner::new(config.command_timeout_secs);
    let result = if is_scratch_root(&snapshot.plan.root) {
        let runner = ScratchRootRunner::new(system, &snapshot.plan.root);
        restore(&runner, &snapshot.plan, &snapshot.dir, dry_run).await
    } else {
        restore(&system, &snapshot.plan, &snapshot.dir, dry_run).await
    };

    if !dry_run {
        let (ok, exit_code, error) = match &result {
            Ok(report) if report.success() => (true, 0, None),
            Ok(report) => (
                false,
                1,
                Some(format!("{} service command(s) failed", report.service_failures.len())),
            ),
            Err(e) => (false, e.exit_code(), Some(e.to_string())),
        };
        RunLogEntry {
            ts: Utc::now().to_rfc3339(),
            run_id: snapshot.manifest.run_id.clone(),
            command: "rollback".to_string(),
            profile: Some(snapshot.manifest.profile.clone()),
            port: Some(snapshot.manifest.port),
            modes: snapshot.manifest.modes.clone(),
            dry_run,
            backup_dir: Some(snapshot.dir.display().to_string()),
            ok,
            exit_code,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .write(&config.log_file);
    }

    let report = result?;
    output::display_restore_report(&report, dry_run);
    Ok(if report.success() { 0 } else { 1 })
}

async fn restore<R: CommandRunner>(
    runner: &R,
    plan: &RestorePlan,
    snapshot_dir: &Path,
    dry_run: bool,
) -> harden_common::Result<RestoreReport> {
    RestoreExecutor::new(
        runner,
        Deployer::new(dry_run, OwnershipPolicy::for_current_process()),
    )
    .execute(plan, snapshot_dir)
    .await
}
