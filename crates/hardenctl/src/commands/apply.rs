//! Apply command

use anyhow::Result;
use chrono::Utc;
use harden_common::logging::RunLogEntry;
use harden_common::session::lockout_hazard;
use harden_common::transaction::active_ssh_config;
use harden_common::{
    CommandRunner, Config, RunRequest, RunSummary, ScratchRootRunner, SshService, SystemRunner,
    Transaction,
};
use std::time::Instant;
use tracing::{debug, info};

use super::{is_scratch_root, require_root};
use crate::output;
use crate::ApplyArgs;

pub async fn run(config: &Config, args: ApplyArgs) -> Result<i32> {
    require_root("apply", args.dry_run, &config.root)?;

    let mut config = config.clone();
    if let Some(secs) = args.countdown {
        config.ssh.countdown_secs = secs;
    }

    // No live daemon reads a scratch root's configuration
    let scratch = is_scratch_root(&config.root);
    let hazard = !scratch && lockout_hazard(args.session, &config.ssh.binary);
    debug!(hazard, scratch, session = ?args.session, "Session classified");

    let request = RunRequest {
        profile: args.profile,
        port: args.port,
        modes: args.modes.clone(),
        dry_run: args.dry_run,
        lockout_hazard: hazard,
        variables: args.vars.into_iter().collect(),
    };

    output::display_run_header(&request);

    let started = Instant::now();
    let system = SystemRunner::new(config.command_timeout_secs);
    let summary = if scratch {
        info!(root = %config.root.display(), "Scratch root: host service commands are not run");
        execute(&config, &request, &ScratchRootRunner::new(system, &config.root)).await?
    } else {
        execute(&config, &request, &system).await?
    };

    output::display_summary(&summary);

    if !summary.dry_run {
        RunLogEntry {
            ts: Utc::now().to_rfc3339(),
            run_id: summary.run_id.clone(),
            command: "apply".to_string(),
            profile: Some(summary.profile.to_string()),
            port: Some(summary.port),
            modes: request.modes.iter().map(|m| m.to_string()).collect(),
            dry_run: false,
            backup_dir: Some(summary.backup_dir.display().to_string()),
            ok: summary.success(),
            exit_code: summary.exit_code(),
            error: summary.error.as_ref().map(|e| e.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .write(&config.log_file);
    }

    Ok(summary.exit_code())
}

async fn execute<R: CommandRunner>(
    config: &Config,
    request: &RunRequest,
    runner: &R,
) -> harden_common::Result<RunSummary> {
    let service = SshService::new(runner, &config.ssh, active_ssh_config(&config.root));

    // Ctrl-C aborts only while the forced cutover counts down
    let abort = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    Transaction::new(config, runner, &service)
        .run(request, abort)
        .await
}
