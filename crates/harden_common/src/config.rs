//! Configuration management for harden.
//!
//! Loads settings from /etc/harden/config.toml or uses defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{HardenError, Result};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/harden/config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem root all managed paths are resolved under
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Directory receiving one timestamped backup area per run
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Optional directory of `<template-id>.tmpl` overrides
    #[serde(default)]
    pub template_dir: Option<PathBuf>,

    /// JSONL run log
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Timeout for every external command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Remote access service settings
    #[serde(default)]
    pub ssh: SshConfig,

    /// Operator-supplied template variables
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote access daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// systemd unit of the daemon
    #[serde(default = "default_ssh_service")]
    pub service: String,

    /// Socket-activation unit that may keep listening on the old port
    #[serde(default = "default_ssh_socket")]
    pub socket_unit: String,

    /// Daemon binary used for `-t` syntax checks
    #[serde(default = "default_ssh_binary")]
    pub binary: String,

    /// Seconds the operator gets to abort a forced port cutover
    #[serde(default = "default_countdown")]
    pub countdown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups/harden")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/harden/runs.jsonl")
}

fn default_command_timeout() -> u64 {
    60
}

fn default_ssh_service() -> String {
    "ssh".to_string()
}

fn default_ssh_socket() -> String {
    "ssh.socket".to_string()
}

fn default_ssh_binary() -> String {
    "sshd".to_string()
}

fn default_countdown() -> u64 {
    10
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            service: default_ssh_service(),
            socket_unit: default_ssh_socket(),
            binary: default_ssh_binary(),
            countdown_secs: default_countdown(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            backup_root: default_backup_root(),
            template_dir: None,
            log_file: default_log_file(),
            command_timeout_secs: default_command_timeout(),
            ssh: SshConfig::default(),
            variables: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(HardenError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from an explicit path, or fall back to defaults when the
    /// standard location does not exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None if Path::new(CONFIG_PATH).exists() => Self::from_file(CONFIG_PATH),
            None => {
                debug!("No config at {}, using defaults", CONFIG_PATH);
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_root.as_os_str().is_empty() {
            return Err(HardenError::InvalidConfig {
                message: "backup_root cannot be empty".to_string(),
            });
        }

        if self.command_timeout_secs == 0 {
            return Err(HardenError::InvalidConfig {
                message: "command_timeout_secs must be greater than zero".to_string(),
            });
        }

        if let Some(bad) = self.variables.keys().find(|k| !is_variable_name(k)) {
            return Err(HardenError::InvalidConfig {
                message: format!("Invalid template variable name: '{}'", bad),
            });
        }

        Ok(())
    }
}

/// Template variable names are upper-case shell-style identifiers.
pub fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
