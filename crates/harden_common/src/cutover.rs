//! Connection-Safety Coordinator
//!
//! Governs the live cutover of the remote-access daemon. The state machine:
//!
//! ```text
//! Staged -> Validated -> Deferred
//!                     -> ForcedCutover -> Confirmed | Degraded
//!                     -> Confirmed                (no lockout hazard)
//! Staged -> Failed                                (syntax test rejected)
//! ```
//!
//! The lockout hazard is a fact computed once per run and passed in; this
//! module never re-detects the session. A degraded forced cutover is never
//! rolled back automatically: the access channel is in an unknown state and
//! recovery goes through the snapshot's restore artifact from a separate
//! session.

use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SshConfig;
use crate::deploy::Deployer;
use crate::error::{HardenError, Result};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoverState {
    Staged,
    Validated,
    Deferred,
    ForcedCutover,
    Confirmed,
    Degraded,
    Failed,
}

impl CutoverState {
    fn can_transition_to(self, next: CutoverState) -> bool {
        use CutoverState::*;
        matches!(
            (self, next),
            (Staged, Validated)
                | (Staged, Failed)
                | (Validated, Deferred)
                | (Validated, ForcedCutover)
                | (Validated, Confirmed)
                | (Validated, Failed)
                | (ForcedCutover, Confirmed)
                | (ForcedCutover, Degraded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CutoverState::Deferred
                | CutoverState::Confirmed
                | CutoverState::Degraded
                | CutoverState::Failed
        )
    }
}

impl std::fmt::Display for CutoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CutoverState::Staged => write!(f, "staged"),
            CutoverState::Validated => write!(f, "validated"),
            CutoverState::Deferred => write!(f, "deferred"),
            CutoverState::ForcedCutover => write!(f, "forced_cutover"),
            CutoverState::Confirmed => write!(f, "confirmed"),
            CutoverState::Degraded => write!(f, "degraded"),
            CutoverState::Failed => write!(f, "failed"),
        }
    }
}

/// Result of a restart request
#[derive(Debug, Clone)]
pub struct RestartReport {
    pub output: CommandOutput,
    /// Service reports itself active afterwards
    pub active: bool,
}

/// What the coordinator needs from the remote-access daemon: a syntax test,
/// a restart, and the ports it is bound to. Observed ports are the only
/// evidence a cutover succeeded; configured ports stand in before the
/// cutover when nothing can be observed.
#[allow(async_fn_in_trait)]
pub trait RemoteAccessService {
    /// Syntax-test a configuration file without applying it.
    async fn test_config(&self, config: &Path) -> Result<CommandOutput>;

    /// Restart the daemon. With `release_socket`, any socket-activation unit
    /// holding the old port is switched off first.
    async fn restart(&self, release_socket: bool) -> Result<RestartReport>;

    /// Ports the daemon is observed listening on. Fails when the socket
    /// table cannot be read.
    async fn listening_ports(&self) -> Result<Vec<u16>>;

    /// Ports named by the active configuration file.
    fn configured_ports(&self) -> Vec<u16>;
}

/// OpenSSH under systemd
pub struct SshService<'a, R: CommandRunner> {
    runner: &'a R,
    config: &'a SshConfig,
    /// Host path of the active daemon configuration
    active_config: PathBuf,
}

impl<'a, R: CommandRunner> SshService<'a, R> {
    pub fn new(runner: &'a R, config: &'a SshConfig, active_config: PathBuf) -> Self {
        Self {
            runner,
            config,
            active_config,
        }
    }
}

impl<R: CommandRunner> RemoteAccessService for SshService<'_, R> {
    async fn test_config(&self, config: &Path) -> Result<CommandOutput> {
        let spec = CommandSpec::new(self.config.binary.as_str())
            .args(["-t", "-f"])
            .arg(config.display().to_string());
        self.runner.run(&spec).await
    }

    async fn restart(&self, release_socket: bool) -> Result<RestartReport> {
        if release_socket && unit_enabled(self.runner, &self.config.socket_unit).await {
            let spec = CommandSpec::new("systemctl")
                .args(["disable", "--now", self.config.socket_unit.as_str()]);
            let out = self.runner.run(&spec).await?;
            if !out.success() {
                warn!(unit = %self.config.socket_unit, "Could not disable socket unit: {}", out.diagnostic());
            }
        }

        let output = self
            .runner
            .run(&CommandSpec::new("systemctl").args(["restart", self.config.service.as_str()]))
            .await?;

        let active = output.success()
            && self
                .runner
                .run(&CommandSpec::new("systemctl").args(["is-active", self.config.service.as_str()]))
                .await
                .map(|out| out.success())
                .unwrap_or(false);

        Ok(RestartReport { output, active })
    }

    async fn listening_ports(&self) -> Result<Vec<u16>> {
        let spec = CommandSpec::new("ss").args(["-H", "-ltnp"]);
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(HardenError::CommandFailed {
                command: spec.to_string(),
                message: out.diagnostic(),
            });
        }
        Ok(parse_listening_ports(&out.stdout, &self.config.binary))
    }

    fn configured_ports(&self) -> Vec<u16> {
        fs::read_to_string(&self.active_config)
            .map(|text| parse_port_directives(&text))
            .unwrap_or_default()
    }
}

/// Whether a systemd unit is enabled. Any failure counts as not enabled.
pub async fn unit_enabled<R: CommandRunner>(runner: &R, unit: &str) -> bool {
    let spec = CommandSpec::new("systemctl").args(["is-enabled", unit]);
    matches!(runner.run(&spec).await, Ok(out) if out.success())
}

/// Ports from `ss -H -ltnp` lines owned by `process`.
pub fn parse_listening_ports(ss_output: &str, process: &str) -> Vec<u16> {
    let needle = format!("\"{}\"", process);
    let mut ports: Vec<u16> = ss_output
        .lines()
        .filter(|line| line.contains(&needle))
        .filter_map(|line| {
            // State Recv-Q Send-Q Local:Port Peer:Port Process
            let local = line.split_whitespace().nth(3)?;
            local.rsplit(':').next()?.parse().ok()
        })
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// `Port` directives from an sshd configuration.
pub fn parse_port_directives(config: &str) -> Vec<u16> {
    config
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            let key = words.next()?;
            if !key.eq_ignore_ascii_case("port") {
                return None;
            }
            words.next()?.parse().ok()
        })
        .collect()
}

/// Abortable operator warning before a forced restart
#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    pub steps: u64,
    pub tick: Duration,
}

impl Countdown {
    pub fn seconds(steps: u64) -> Self {
        Self {
            steps,
            tick: Duration::from_secs(1),
        }
    }

    /// Count down, returning `Aborted` as soon as `abort` resolves.
    pub async fn run<F: Future<Output = ()>>(&self, port: u16, abort: F) -> Result<()> {
        tokio::pin!(abort);
        for remaining in (1..=self.steps).rev() {
            warn!(
                port,
                remaining,
                "Restarting remote access on a new port; interrupt now to abort"
            );
            tokio::select! {
                _ = &mut abort => {
                    return Err(HardenError::Aborted {
                        message: format!("port cutover to {} aborted during countdown", port),
                    });
                }
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
        Ok(())
    }
}

/// Staged sibling and the destination it will replace, both host paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub staged: PathBuf,
    pub dest: PathBuf,
}

/// Remote-access configuration in flight
#[derive(Debug)]
pub struct PendingCutover {
    files: Vec<StagedFile>,
    state: CutoverState,
}

impl PendingCutover {
    pub fn new(files: Vec<StagedFile>) -> Self {
        Self {
            files,
            state: CutoverState::Staged,
        }
    }

    pub fn state(&self) -> CutoverState {
        self.state
    }

    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }

    fn advance(&mut self, next: CutoverState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(HardenError::InvalidArgument {
                message: format!("invalid cutover transition {} -> {}", self.state, next),
            });
        }
        debug!(from = %self.state, to = %next, "Cutover transition");
        self.state = next;
        Ok(())
    }
}

/// How a cutover ended
#[derive(Debug, Clone)]
pub struct CutoverReport {
    pub state: CutoverState,
    pub port: u16,
    /// Ports the daemon listened on before the cutover
    pub previous_ports: Vec<u16>,
    /// Action the operator still has to take, if any
    pub instruction: Option<String>,
}

pub struct Coordinator<'a, S: RemoteAccessService> {
    service: &'a S,
    deployer: &'a Deployer,
    countdown: Countdown,
    service_name: String,
}

impl<'a, S: RemoteAccessService> Coordinator<'a, S> {
    pub fn new(service: &'a S, deployer: &'a Deployer, countdown: Countdown, service_name: &str) -> Self {
        Self {
            service,
            deployer,
            countdown,
            service_name: service_name.to_string(),
        }
    }

    /// Staged -> Validated, or Failed with the staged files discarded and the
    /// active configuration untouched.
    pub async fn validate(&self, mut pending: PendingCutover) -> Result<PendingCutover> {
        if self.deployer.is_dry_run() {
            info!("[DRY RUN] Would syntax-test staged remote access configuration");
            pending.advance(CutoverState::Validated)?;
            return Ok(pending);
        }

        for file in &pending.files {
            let output = match self.service.test_config(&file.staged).await {
                Ok(output) => output,
                Err(e) => {
                    pending.advance(CutoverState::Failed)?;
                    self.abandon(pending);
                    return Err(e);
                }
            };

            if !output.success() {
                warn!(path = %file.dest.display(), "Remote access configuration rejected");
                pending.advance(CutoverState::Failed)?;
                self.abandon(pending);
                return Err(HardenError::ValidationFailed {
                    subsystem: "ssh".to_string(),
                    output: output.diagnostic(),
                });
            }
        }

        pending.advance(CutoverState::Validated)?;
        info!("Remote access configuration validated");
        Ok(pending)
    }

    /// Drop staged files without touching the active configuration.
    pub fn abandon(&self, pending: PendingCutover) {
        for file in &pending.files {
            self.deployer.discard(&file.staged);
        }
    }

    /// Take a validated configuration live.
    ///
    /// `abort` resolving during the countdown cancels a forced cutover before
    /// anything is promoted.
    pub async fn cutover<F: Future<Output = ()>>(
        &self,
        mut pending: PendingCutover,
        lockout_hazard: bool,
        port: u16,
        abort: F,
    ) -> Result<CutoverReport> {
        let previous_ports = self.current_ports().await;
        let port_changes = !previous_ports.contains(&port);

        info!(
            lockout_hazard,
            port,
            ?previous_ports,
            "Remote access cutover"
        );

        let mut report = CutoverReport {
            state: pending.state,
            port,
            previous_ports,
            instruction: None,
        };

        if !lockout_hazard {
            if self.deployer.is_dry_run() {
                info!(service = %self.service_name, "[DRY RUN] Would restart remote access service");
                self.promote(&pending)?;
                return Ok(report);
            }

            self.promote(&pending)?;
            let restart = self.service.restart(port_changes).await?;
            if !restart.active {
                pending.advance(CutoverState::Failed)?;
                return Err(HardenError::CommandFailed {
                    command: format!("systemctl restart {}", self.service_name),
                    message: restart.output.diagnostic(),
                });
            }
            pending.advance(CutoverState::Confirmed)?;
            report.state = pending.state;
            info!(port, "Remote access service restarted");
            return Ok(report);
        }

        if !port_changes {
            self.promote(&pending)?;
            pending.advance(CutoverState::Deferred)?;
            report.state = pending.state;
            let instruction = format!(
                "Restart from a second, independent session once you have confirmed access: systemctl restart {}",
                self.service_name
            );
            warn!("{}", instruction);
            report.instruction = Some(instruction);
            return Ok(report);
        }

        pending.advance(CutoverState::ForcedCutover)?;
        report.state = pending.state;

        if self.deployer.is_dry_run() {
            info!(
                port,
                steps = self.countdown.steps,
                "[DRY RUN] Would count down, restart and probe the new port"
            );
            self.promote(&pending)?;
            return Ok(report);
        }

        if let Err(e) = self.countdown.run(port, abort).await {
            self.abandon(pending);
            return Err(e);
        }

        // Past this point the cutover is irrevocable within this process
        self.promote(&pending)?;
        let restart = match self.service.restart(true).await {
            Ok(restart) => restart,
            Err(e) => {
                pending.advance(CutoverState::Degraded)?;
                return Err(HardenError::CutoverDegraded {
                    port,
                    reason: format!("service restart failed: {}", e),
                });
            }
        };
        if !restart.active {
            warn!("Remote access service did not report active: {}", restart.output.diagnostic());
        }

        // One probe, no retry. Only an observed socket confirms the new port.
        let probe = self.service.listening_ports().await;
        if restart.active && matches!(&probe, Ok(ports) if ports.contains(&port)) {
            pending.advance(CutoverState::Confirmed)?;
            info!(port, "Remote access confirmed on new port");
            report.state = pending.state;
            return Ok(report);
        }

        pending.advance(CutoverState::Degraded)?;
        let reason = if !restart.active {
            format!("service restart failed: {}", restart.output.diagnostic())
        } else {
            match probe {
                Ok(ports) => format!("service is active but listening on {:?}", ports),
                Err(e) => format!("listening sockets could not be observed: {}", e),
            }
        };
        Err(HardenError::CutoverDegraded { port, reason })
    }

    /// Ports in use before the cutover: observed, else configured, else 22.
    async fn current_ports(&self) -> Vec<u16> {
        match self.service.listening_ports().await {
            Ok(ports) if !ports.is_empty() => return ports,
            Ok(_) => debug!("No listening socket found, using configured ports"),
            Err(e) => debug!(error = %e, "Socket table unavailable, using configured ports"),
        }
        let ports = self.service.configured_ports();
        if ports.is_empty() {
            vec![22]
        } else {
            ports
        }
    }

    fn promote(&self, pending: &PendingCutover) -> Result<()> {
        for file in &pending.files {
            self.deployer.promote(&file.staged, &file.dest)?;
        }
        Ok(())
    }
}
