//! Plan command - resolved groups and variables, no side effects

use anyhow::Result;
use harden_common::profile::layered_variables;
use harden_common::subsystem::ValidationSpec;
use harden_common::{resolve, Config, Mode, Profile};
use owo_colors::OwoColorize;

pub fn run(config: &Config, profile: Profile, port: u16, modes: &[Mode]) -> Result<i32> {
    let groups = resolve(profile, modes);

    println!();
    println!("{}", format!("Profile: {}", profile).bold());
    println!();

    if groups.is_empty() {
        println!("  Nothing selected for this profile and mode combination.");
        println!();
        return Ok(0);
    }

    for (index, group) in groups.iter().enumerate() {
        println!(
            "  {}. {} {} [{}]",
            index + 1,
            group.id.bold(),
            format!("({})", group.level).dimmed(),
            group.subsystem.cyan()
        );
        for item in &group.items {
            println!(
                "       {} {:o} {}  <- {}",
                item.target.display(),
                item.mode,
                item.owner,
                item.template_id.dimmed()
            );
        }
        println!("       validation: {}", describe(&group.subsystem.validation()));
    }

    let vars = layered_variables(profile, &config.variables, port);
    println!();
    println!("{}", "Variables".bold());
    for (name, value) in &vars {
        println!("  {} = {}", name, value);
    }
    println!();
    Ok(0)
}

fn describe(validation: &ValidationSpec) -> String {
    match validation {
        ValidationSpec::None => "none".to_string(),
        ValidationSpec::StagedCommand(argv) => format!("{} (staged file)", argv.join(" ")),
        ValidationSpec::InstalledCommand(argv) => format!("{} (installed tree)", argv.join(" ")),
        ValidationSpec::KernelParameters => "every key must exist under /proc/sys".to_string(),
        ValidationSpec::RemoteAccess => "daemon syntax test, then connection-safe cutover".to_string(),
    }
}
