//! One hardening run, end to end.
//!
//! snapshot -> per-group apply -> remote-access cutover, as a single linear
//! pass. Once the snapshot is finalized every outcome, success or failure,
//! comes back as a [`RunSummary`] naming the backup area and restore
//! artifact.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

use crate::config::Config;
use crate::context::{ItemResult, Outcome, RunContext};
use crate::cutover::{unit_enabled, Coordinator, Countdown, CutoverReport, CutoverState, RemoteAccessService};
use crate::deploy::{Deployer, OwnershipPolicy};
use crate::error::{HardenError, Result};
use crate::profile::{layered_variables, resolve, Controller, Profile};
use crate::restore::ServiceCommand;
use crate::runner::{CommandRunner, CommandSpec};
use crate::snapshot::{RunManifest, Snapshot, SnapshotManager};
use crate::subsystem::{Mode, Subsystem};
use crate::template::{TemplateRenderer, Variables};

/// Operator intent for one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub profile: Profile,
    pub port: u16,
    pub modes: Vec<Mode>,
    pub dry_run: bool,
    /// Session carried by the remote-access daemon
    pub lockout_hazard: bool,
    /// Layered over the configuration file's variables
    pub variables: Variables,
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub dry_run: bool,
    pub lockout_hazard: bool,
    pub profile: Profile,
    pub port: u16,
    pub backup_dir: PathBuf,
    pub restore_script: PathBuf,
    pub results: Vec<ItemResult>,
    pub committed: Vec<String>,
    pub cutover: Option<CutoverReport>,
    /// Set when the run did not complete
    pub error: Option<HardenError>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map(HardenError::exit_code).unwrap_or(0)
    }
}

pub struct Transaction<'a, R: CommandRunner, S: RemoteAccessService> {
    config: &'a Config,
    runner: &'a R,
    service: &'a S,
    tick: Duration,
}

impl<'a, R: CommandRunner, S: RemoteAccessService> Transaction<'a, R, S> {
    pub fn new(config: &'a Config, runner: &'a R, service: &'a S) -> Self {
        Self {
            config,
            runner,
            service,
            tick: Duration::from_secs(1),
        }
    }

    /// Length of one countdown step.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run the transaction. `Err` only for failures before the snapshot
    /// exists; everything later is reported in the summary.
    pub async fn run<F: Future<Output = ()>>(&self, request: &RunRequest, abort: F) -> Result<RunSummary> {
        if request.port == 0 {
            return Err(HardenError::InvalidArgument {
                message: "port must be between 1 and 65535".to_string(),
            });
        }

        let groups = resolve(request.profile, &request.modes);
        if groups.is_empty() {
            return Err(HardenError::InvalidArgument {
                message: format!(
                    "profile '{}' has nothing to apply for the selected modes",
                    request.profile
                ),
            });
        }

        let mut ctx = RunContext::new(
            request.profile,
            request.port,
            request.modes.clone(),
            &self.config.root,
            request.dry_run,
            request.lockout_hazard,
        );
        for item in groups.iter().flat_map(|g| &g.items) {
            ctx.managed.register(item.target.clone());
        }

        let mut operator = self.config.variables.clone();
        operator.extend(request.variables.clone());
        let vars = layered_variables(request.profile, &operator, request.port);

        let manifest = RunManifest::new(
            request.profile.as_str(),
            request.port,
            ctx.mode_names(),
            request.dry_run,
            request.lockout_hazard,
            &self.config.root,
        );

        let mut snapshot = SnapshotManager::begin(&self.config.backup_root, &self.config.root, manifest, request.dry_run)?;
        for path in ctx.managed.iter() {
            snapshot.capture(path)?;
        }

        let subsystems: BTreeSet<Subsystem> = groups.iter().map(|g| g.subsystem).collect();
        let service_commands = self.restore_commands(&subsystems).await;
        let snapshot = snapshot.finalize(service_commands)?;
        ctx.managed.mark_captured();

        info!(
            run_id = %snapshot.manifest.run_id,
            backup = %snapshot.dir.display(),
            groups = groups.len(),
            "Snapshot ready, applying"
        );

        let deployer = Deployer::new(request.dry_run, OwnershipPolicy::for_current_process());
        let renderer = TemplateRenderer::new(self.config.template_dir.clone());
        let countdown = Countdown {
            steps: self.config.ssh.countdown_secs,
            tick: self.tick,
        };
        let coordinator = Coordinator::new(self.service, &deployer, countdown, &self.config.ssh.service);
        let controller = Controller::new(&renderer, &deployer, self.runner, &coordinator, &self.config.ssh);

        let mut committed = Vec::new();
        let mut cutover = None;

        let error = match controller.apply(&groups, &vars, &mut ctx).await {
            Err(e) => {
                if let HardenError::ProfileApplicationFailed { committed: done, .. } = &e {
                    committed = done.clone();
                }
                Some(e)
            }
            Ok(report) => {
                committed = report.committed;
                match report.pending {
                    None => None,
                    Some(pending) => {
                        let result = coordinator
                            .cutover(pending, ctx.lockout_hazard, ctx.port, abort)
                            .await;
                        let (state, error) = match result {
                            Ok(report) => {
                                let state = report.state;
                                cutover = Some(report);
                                (Outcome::Cutover { state }, None)
                            }
                            Err(e @ HardenError::CutoverDegraded { .. }) => (
                                Outcome::Cutover {
                                    state: CutoverState::Degraded,
                                },
                                Some(e),
                            ),
                            Err(e @ HardenError::Aborted { .. }) => (Outcome::Abandoned, Some(e)),
                            Err(e) => (
                                Outcome::Cutover {
                                    state: CutoverState::Failed,
                                },
                                Some(e),
                            ),
                        };
                        ctx.update(Subsystem::RemoteAccess, &Outcome::Staged, state);
                        error
                    }
                }
            }
        };

        if let Some(e) = &error {
            error!(
                error = %e,
                restore = %snapshot.restore_script_path().display(),
                "Run failed"
            );
        }

        Ok(self.summary(&snapshot, ctx, committed, cutover, error))
    }

    /// Commands that make restored files take effect, for every
    /// participating subsystem.
    async fn restore_commands(&self, subsystems: &BTreeSet<Subsystem>) -> Vec<ServiceCommand> {
        let mut commands = Vec::new();
        for subsystem in subsystems {
            if *subsystem == Subsystem::RemoteAccess
                && unit_enabled(self.runner, &self.config.ssh.socket_unit).await
            {
                let enable = CommandSpec::new("systemctl").args([
                    "enable",
                    "--now",
                    self.config.ssh.socket_unit.as_str(),
                ]);
                commands.push(ServiceCommand::new(*subsystem, &enable));
            }
            if let Some(spec) = subsystem.service_action(&self.config.ssh) {
                commands.push(ServiceCommand::new(*subsystem, &spec));
            }
        }
        commands
    }

    fn summary(
        &self,
        snapshot: &Snapshot,
        ctx: RunContext,
        committed: Vec<String>,
        cutover: Option<CutoverReport>,
        error: Option<HardenError>,
    ) -> RunSummary {
        RunSummary {
            run_id: snapshot.manifest.run_id.clone(),
            dry_run: ctx.dry_run,
            lockout_hazard: ctx.lockout_hazard,
            profile: ctx.profile,
            port: ctx.port,
            backup_dir: snapshot.dir.clone(),
            restore_script: snapshot.restore_script_path(),
            results: ctx.results,
            committed,
            cutover,
            error,
        }
    }
}

/// Host path of the daemon configuration the cutover replaces.
pub fn active_ssh_config(root: &Path) -> PathBuf {
    crate::paths::host_path(root, Path::new("/etc/ssh/sshd_config"))
}
