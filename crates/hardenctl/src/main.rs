//! Harden Control - operator CLI for the hardening engine
//!
//! Applies security profiles to the local host, previews them, and rolls
//! a run back from its snapshot.

mod commands;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use harden_common::config::is_variable_name;
use harden_common::{Config, HardenError, Mode, Profile, SessionOverride};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hardenctl")]
#[command(about = "Harden - connection-safe host hardening", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: /etc/harden/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Show progress (info level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show everything (debug level)
    #[arg(long, global = true)]
    debug: bool,

    /// Operate on a different filesystem root
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Where backup areas are created
    #[arg(long, global = true, value_name = "DIR")]
    backup_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a security profile
    Apply(ApplyArgs),

    /// Show what a profile would deploy, without side effects
    Plan {
        #[arg(long, default_value = "standard")]
        profile: Profile,

        /// Target remote access port used to render variables
        #[arg(long, default_value_t = 22)]
        port: u16,

        /// Restrict to subsystems (repeatable)
        #[arg(long = "mode", value_name = "MODE")]
        modes: Vec<Mode>,
    },

    /// Restore a snapshot (backup directory or run id)
    Rollback {
        snapshot: PathBuf,

        /// Print the restore actions without performing them
        #[arg(long)]
        dry_run: bool,
    },

    /// List snapshots, newest first
    Snapshots,

    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct ApplyArgs {
    #[arg(long, default_value = "standard")]
    pub profile: Profile,

    /// Remote access port after the run
    #[arg(long, default_value_t = 22)]
    pub port: u16,

    /// Restrict to subsystems (repeatable): all, ssh, kernel, intrusion, mac, container, web, banner
    #[arg(long = "mode", value_name = "MODE")]
    pub modes: Vec<Mode>,

    /// Log intended actions without touching the host
    #[arg(long)]
    pub dry_run: bool,

    /// Template variable (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Whether this session depends on the remote access daemon
    #[arg(long, default_value = "auto")]
    pub session: SessionOverride,

    /// Seconds to wait before a forced port cutover
    #[arg(long, value_name = "SECS")]
    pub countdown: Option<u64>,
}

fn parse_var(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if !is_variable_name(key) {
        return Err(format!("invalid variable name '{}'", key));
    }
    Ok((key.to_string(), value.to_string()))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(backup_root) = &cli.backup_root {
        config.backup_root = backup_root.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;
    harden_common::logging::init_tracing(&config.logging.level, cli.verbose, cli.debug);

    match cli.command {
        Commands::Apply(args) => commands::apply::run(&config, args).await,
        Commands::Plan {
            profile,
            port,
            modes,
        } => commands::plan::run(&config, profile, port, &modes),
        Commands::Rollback { snapshot, dry_run } => {
            commands::rollback::run(&config, &snapshot, dry_run).await
        }
        Commands::Snapshots => commands::snapshots::run(&config),
        Commands::Config => commands::config::run(&config),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::display_error(&format!("{:#}", e));
            e.downcast_ref::<HardenError>()
                .map(HardenError::exit_code)
                .unwrap_or(1)
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_arguments() {
        let cli = Cli::try_parse_from([
            "hardenctl",
            "apply",
            "--profile",
            "hardened",
            "--port",
            "2222",
            "--mode",
            "ssh",
            "--mode",
            "kernel",
            "--var",
            "BANNER_ORGANIZATION=ACME",
            "--dry-run",
            "--session",
            "remote",
        ])
        .unwrap();

        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.profile, Profile::Hardened);
        assert_eq!(args.port, 2222);
        assert_eq!(args.modes, vec![Mode::Ssh, Mode::Kernel]);
        assert_eq!(
            args.vars,
            vec![("BANNER_ORGANIZATION".to_string(), "ACME".to_string())]
        );
        assert!(args.dry_run);
        assert_eq!(args.session, SessionOverride::Remote);
        assert_eq!(args.countdown, None);
    }

    #[test]
    fn test_apply_defaults() {
        let cli = Cli::try_parse_from(["hardenctl", "apply"]).unwrap();
        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.profile, Profile::Standard);
        assert_eq!(args.port, 22);
        assert!(args.modes.is_empty());
        assert_eq!(args.session, SessionOverride::Auto);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hardenctl",
            "snapshots",
            "--root",
            "/tmp/sysroot",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/sysroot")));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Cli::try_parse_from(["hardenctl", "apply", "--profile", "paranoid"]).is_err());
        assert!(Cli::try_parse_from(["hardenctl", "apply", "--mode", "bogus"]).is_err());
        assert!(Cli::try_parse_from(["hardenctl", "apply", "--port", "70000"]).is_err());
        assert!(Cli::try_parse_from(["hardenctl", "apply", "--var", "lower=1"]).is_err());
        assert!(Cli::try_parse_from(["hardenctl", "apply", "--var", "NOEQUALS"]).is_err());
    }

    #[test]
    fn test_rollback_arguments() {
        let cli =
            Cli::try_parse_from(["hardenctl", "rollback", "20260101-120000", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Rollback { snapshot, dry_run } => {
                assert_eq!(snapshot, PathBuf::from("20260101-120000"));
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
