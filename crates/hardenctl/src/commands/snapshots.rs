//! Snapshots command

use anyhow::Result;
use harden_common::{list_snapshots, Config};
use owo_colors::OwoColorize;

pub fn run(config: &Config) -> Result<i32> {
    let snapshots = list_snapshots(&config.backup_root)?;

    if snapshots.is_empty() {
        println!("No snapshots under {}", config.backup_root.display());
        return Ok(0);
    }

    println!(
        "{}",
        format!(
            "{:<20} {:<26} {:<9} {:>5}  {}",
            "RUN", "CREATED", "PROFILE", "PORT", "MODES"
        )
        .bold()
    );
    for (dir, manifest) in &snapshots {
        let mut line = format!(
            "{:<20} {:<26} {:<9} {:>5}  {}",
            manifest.run_id,
            manifest.created_at.get(..19).unwrap_or(&manifest.created_at),
            manifest.profile,
            manifest.port,
            manifest.modes.join(",")
        );
        if manifest.dry_run {
            line.push_str("  (dry run)");
        }
        println!("{}", line);
        println!("  {}", dir.join("restore.sh").display().dimmed());
    }
    Ok(0)
}
