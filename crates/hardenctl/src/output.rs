//! Output formatting - ASCII-only terminal output

use harden_common::context::Outcome;
use harden_common::restore::{RestoreAction, RestoreReport};
use harden_common::{CutoverState, HardenError, RunRequest, RunSummary, Snapshot};
use owo_colors::OwoColorize;

const SEPARATOR: &str = "------------------------------------------------------------";

/// Severity at which a failure concerns the operator's own access channel
const CRITICAL_SEVERITY: u8 = 4;

/// Display an error
pub fn display_error(message: &str) {
    eprintln!();
    eprintln!("[ERROR] {}", message.red());
    eprintln!();
}

pub fn display_run_header(request: &RunRequest) {
    println!();
    let modes = if request.modes.is_empty() {
        "all".to_string()
    } else {
        request
            .modes
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    println!(
        "{} profile={} port={} modes={}",
        "Harden".bold(),
        request.profile,
        request.port,
        modes
    );
    if request.dry_run {
        println!("{}", "[DRY RUN] nothing on this host will change".yellow());
    }
    if request.lockout_hazard {
        println!(
            "{}",
            "[NOTE] this session runs through the remote access daemon".yellow()
        );
    }
    println!("{}", SEPARATOR.dimmed());
}

fn outcome_label(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Installed => "[OK]".bright_green().to_string(),
        Outcome::WouldInstall => "[WOULD INSTALL]".cyan().to_string(),
        Outcome::Staged => "[STAGED]".cyan().to_string(),
        Outcome::Abandoned => "[ABANDONED]".yellow().to_string(),
        Outcome::NotRendered { .. } => "[NOT RENDERED]".bright_red().to_string(),
        Outcome::InstallFailed { .. } => "[INSTALL FAILED]".bright_red().to_string(),
        Outcome::ValidationFailed { .. } => "[INVALID]".bright_red().to_string(),
        Outcome::Cutover { state } => match state {
            CutoverState::Confirmed => "[OK]".bright_green().to_string(),
            CutoverState::Deferred => "[DEFERRED]".yellow().to_string(),
            CutoverState::Degraded => "[DEGRADED]".bright_red().to_string(),
            CutoverState::Failed => "[FAILED]".bright_red().to_string(),
            other => format!("[{}]", other.to_string().to_uppercase()).cyan().to_string(),
        },
    }
}

fn outcome_detail(outcome: &Outcome) -> Option<&str> {
    match outcome {
        Outcome::NotRendered { reason } | Outcome::InstallFailed { reason } => Some(reason),
        Outcome::ValidationFailed { output } => Some(output),
        _ => None,
    }
}

pub fn display_summary(summary: &RunSummary) {
    println!();
    for result in &summary.results {
        println!(
            "{:<18} {:<28} {}",
            outcome_label(&result.outcome),
            result.group,
            result.target.display()
        );
        if let Some(detail) = outcome_detail(&result.outcome) {
            for line in detail.lines().take(6) {
                println!("    {}", line.dimmed());
            }
        }
    }

    if let Some(cutover) = &summary.cutover {
        println!();
        let ports = cutover
            .previous_ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "Remote access: {} (port {} -> {})",
            cutover.state, ports, cutover.port
        );
        if let Some(instruction) = &cutover.instruction {
            println!("[ACTION] {}", instruction.yellow());
        }
    }

    println!();
    println!("{}", SEPARATOR.dimmed());
    if summary.dry_run {
        println!("Backup area (not created): {}", summary.backup_dir.display());
    } else {
        println!("Backup area: {}", summary.backup_dir.display());
    }

    match &summary.error {
        None => {
            println!("{} {}", "[OK]".bright_green(), "Run complete".bold());
        }
        Some(error) => {
            display_failure(error);
            if !summary.committed.is_empty() {
                println!("  Committed groups: {}", summary.committed.join(", "));
            }
            if !summary.dry_run {
                println!(
                    "  To restore: sudo {}",
                    summary.restore_script.display().to_string().bold()
                );
            }
        }
    }
    println!();
}

/// Failure line, scaled to how severe the failure is.
fn display_failure(error: &HardenError) {
    if is_critical(error) {
        println!("{}", "[CRITICAL] REMOTE ACCESS UNCONFIRMED".on_red().white().bold());
        println!("{}", error.to_string().bright_red().bold());
        println!(
            "  Check access from a second, independent session before closing this one."
        );
        return;
    }

    println!("{} {}", "[ERROR]".bright_red(), error.to_string().red());
}

fn is_critical(error: &HardenError) -> bool {
    error.severity() >= CRITICAL_SEVERITY
}

pub fn display_restore_plan(snapshot: &Snapshot, dry_run: bool) {
    println!();
    println!(
        "{} run {} ({} profile, created {})",
        "Restoring".bold(),
        snapshot.manifest.run_id,
        snapshot.manifest.profile,
        snapshot.manifest.created_at
    );
    if dry_run {
        println!("{}", "[DRY RUN] nothing on this host will change".yellow());
    }
    println!("{}", SEPARATOR.dimmed());
    for action in &snapshot.plan.actions {
        let verb = match action {
            RestoreAction::RestoreFile { .. } => "restore",
            RestoreAction::RestoreSymlink { .. } => "relink",
            RestoreAction::RestoreDir { .. } => "mkdir",
            RestoreAction::Remove { .. } => "remove",
        };
        println!("  {:<8} {}", verb, action.path().display());
    }
    for command in &snapshot.plan.service_commands {
        println!("  {:<8} {}", "run", command.argv.join(" "));
    }
}

pub fn display_restore_report(report: &RestoreReport, dry_run: bool) {
    println!();
    let prefix = if dry_run { "Would restore" } else { "Restored" };
    println!(
        "{}: {} path(s), removed {}, {} service command(s)",
        prefix,
        report.restored.len(),
        report.removed.len(),
        report.services_restarted.len()
    );
    for (command, diagnostic) in &report.service_failures {
        println!("{} {}: {}", "[WARNING]".yellow(), command, diagnostic);
    }
    if report.success() {
        println!("{} {}", "[OK]".bright_green(), "Restore complete".bold());
    } else {
        println!(
            "{} files restored, some services need attention",
            "[WARNING]".yellow()
        );
    }
    println!();
}
