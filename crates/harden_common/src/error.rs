//! Error types for the hardening engine.
//!
//! The first five variants are the transaction failure categories; the rest
//! are ambient failures (config, privilege, IO) surfaced by the same paths.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, HardenError>;

#[derive(Error, Debug)]
pub enum HardenError {
    /// Template render aborted before any substitution, nothing written
    #[error("Template '{template}' is missing required variable(s): {}", missing.join(", "))]
    MissingVariable {
        template: String,
        missing: Vec<String>,
    },

    /// Filesystem-level failure; the destination was left untouched
    #[error("Failed to install {}: {message}", path.display())]
    InstallFailed { path: PathBuf, message: String },

    /// Subsystem rejected the rendered configuration; no restart was issued
    #[error("Validation failed for {subsystem}:\n{output}")]
    ValidationFailed { subsystem: String, output: String },

    /// A group failed after earlier groups were already committed
    #[error("Profile application stopped at group '{group}' ({} group(s) already committed): {cause}", committed.len())]
    ProfileApplicationFailed {
        group: String,
        committed: Vec<String>,
        cause: Box<HardenError>,
    },

    /// Forced port change could not confirm the service on the new port
    #[error("Remote access cutover to port {port} is unconfirmed: {reason}")]
    CutoverDegraded { port: u16, reason: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Root privileges required: {message}")]
    PrivilegeRequired { message: String },

    #[error("Template not found: {id}")]
    TemplateNotFound { id: String },

    #[error("Snapshot error: {message}")]
    Snapshot { message: String },

    #[error("Restore failed for {}: {message}", path.display())]
    RestoreFailed { path: PathBuf, message: String },

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Operator interrupted the run before an irrevocable step
    #[error("Aborted by operator: {message}")]
    Aborted { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl HardenError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            HardenError::CutoverDegraded { .. } => 10,
            HardenError::ProfileApplicationFailed { .. } => 4,
            HardenError::ValidationFailed { .. } => 3,
            HardenError::InstallFailed { .. } => 2,
            HardenError::MissingVariable { .. } => 5,
            HardenError::Aborted { .. } => 130,
            HardenError::PrivilegeRequired { .. } => 77,
            HardenError::ConfigNotFound { .. }
            | HardenError::InvalidConfig { .. }
            | HardenError::InvalidArgument { .. }
            | HardenError::Toml(_) => 64,
            _ => 1,
        }
    }

    /// Relative severity; higher is worse. Cutover uncertainty outranks
    /// everything because it concerns the operator's own access channel.
    pub fn severity(&self) -> u8 {
        match self {
            HardenError::CutoverDegraded { .. } => 4,
            HardenError::ProfileApplicationFailed { .. } => 3,
            HardenError::ValidationFailed { .. } | HardenError::InstallFailed { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_variable_message_lists_names() {
        let err = HardenError::MissingVariable {
            template: "sshd".to_string(),
            missing: vec!["SSH_PORT".to_string(), "ALLOW_GROUPS".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("SSH_PORT, ALLOW_GROUPS"));
    }

    #[test]
    fn test_cutover_degraded_is_most_severe() {
        let degraded = HardenError::CutoverDegraded {
            port: 2222,
            reason: "not listening".to_string(),
        };
        let validation = HardenError::ValidationFailed {
            subsystem: "kernel".to_string(),
            output: "bad key".to_string(),
        };
        assert!(degraded.severity() > validation.severity());
        assert_eq!(degraded.exit_code(), 10);
    }

    #[test]
    fn test_group_failure_names_its_cause() {
        let err = HardenError::ProfileApplicationFailed {
            group: "intrusion-prevention".to_string(),
            committed: vec!["kernel-base".to_string()],
            cause: Box::new(HardenError::ValidationFailed {
                subsystem: "fail2ban".to_string(),
                output: "ERROR jail".to_string(),
            }),
        };
        assert!(err.to_string().contains("ERROR jail"));
        assert!(err.severity() > 2);
        assert_eq!(err.exit_code(), 4);
    }
}
