//! Profile Layering Controller
//!
//! Resolves a security level into ordered configuration groups and applies
//! them one group at a time: render every item, install, validate, then make
//! the group live. The first failing group stops the run. Earlier groups
//! stay installed; recovery is the snapshot's restore artifact.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::catalog::{GroupDef, GROUPS};
use crate::config::SshConfig;
use crate::context::{Outcome, RunContext};
use crate::cutover::{Coordinator, PendingCutover, RemoteAccessService, StagedFile};
use crate::deploy::{Deployer, FileOwner, OwnerSpec};
use crate::error::{HardenError, Result};
use crate::paths::staged_path;
use crate::runner::CommandRunner;
use crate::subsystem::{
    check_kernel_parameters, selected_subsystems, validation_command, Mode, Subsystem,
    ValidationSpec,
};
use crate::template::{TemplateRenderer, Variables};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Minimal,
    Standard,
    Hardened,
}

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::Minimal, Profile::Standard, Profile::Hardened];

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Minimal => "minimal",
            Profile::Standard => "standard",
            Profile::Hardened => "hardened",
        }
    }

    /// Whether this profile deploys everything `other` deploys.
    pub fn includes(&self, other: Profile) -> bool {
        *self >= other
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = HardenError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minimal" => Ok(Profile::Minimal),
            "standard" => Ok(Profile::Standard),
            "hardened" => Ok(Profile::Hardened),
            other => Err(HardenError::InvalidArgument {
                message: format!("unknown profile '{}' (minimal, standard, hardened)", other),
            }),
        }
    }
}

/// A unit of change, immutable for the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationItem {
    pub template_id: String,
    /// Absolute path on the managed host
    pub target: PathBuf,
    pub required_vars: Vec<String>,
    pub mode: u32,
    pub owner: OwnerSpec,
    pub validation: ValidationSpec,
}

/// Items applied and validated as one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigGroup {
    pub id: String,
    pub level: Profile,
    pub subsystem: Subsystem,
    pub items: Vec<ConfigurationItem>,
}

impl From<&GroupDef> for ConfigGroup {
    fn from(def: &GroupDef) -> Self {
        let items = def
            .items
            .iter()
            .map(|item| ConfigurationItem {
                template_id: item.template_id.to_string(),
                target: PathBuf::from(item.target),
                required_vars: item.required.iter().map(|s| s.to_string()).collect(),
                mode: item.mode,
                owner: OwnerSpec::new(item.user, item.group),
                validation: def.subsystem.validation(),
            })
            .collect();

        Self {
            id: def.id.to_string(),
            level: def.level,
            subsystem: def.subsystem,
            items,
        }
    }
}

/// Groups for `profile`, restricted to the subsystems `modes` select.
///
/// Cumulative and order-preserving: every lower level's groups come first,
/// in catalog order.
pub fn resolve(profile: Profile, modes: &[Mode]) -> Vec<ConfigGroup> {
    let selected = selected_subsystems(modes);
    let mut groups: Vec<&GroupDef> = GROUPS
        .iter()
        .filter(|g| profile.includes(g.level) && selected.contains(&g.subsystem))
        .collect();
    // Stable: catalog order within a level
    groups.sort_by_key(|g| g.level);
    groups.into_iter().map(ConfigGroup::from).collect()
}

/// Variables for a run: profile defaults, then operator values, then the
/// run-derived ones.
pub fn layered_variables(profile: Profile, operator: &Variables, port: u16) -> Variables {
    let mut vars = crate::catalog::default_variables(profile);
    vars.extend(operator.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars.insert("SSH_PORT".to_string(), port.to_string());
    vars
}

/// What `apply` leaves for the caller
#[derive(Debug)]
pub struct ApplyReport {
    /// Groups whose configuration is installed, in order
    pub committed: Vec<String>,
    /// Validated remote-access configuration awaiting cutover
    pub pending: Option<PendingCutover>,
}

pub struct Controller<'a, R: CommandRunner, S: RemoteAccessService> {
    renderer: &'a TemplateRenderer,
    deployer: &'a Deployer,
    runner: &'a R,
    coordinator: &'a Coordinator<'a, S>,
    ssh: &'a SshConfig,
}

impl<'a, R: CommandRunner, S: RemoteAccessService> Controller<'a, R, S> {
    pub fn new(
        renderer: &'a TemplateRenderer,
        deployer: &'a Deployer,
        runner: &'a R,
        coordinator: &'a Coordinator<'a, S>,
        ssh: &'a SshConfig,
    ) -> Self {
        Self {
            renderer,
            deployer,
            runner,
            coordinator,
            ssh,
        }
    }

    /// Apply `groups` in order, stopping at the first failure.
    pub async fn apply(
        &self,
        groups: &[ConfigGroup],
        vars: &Variables,
        ctx: &mut RunContext,
    ) -> Result<ApplyReport> {
        let mut committed: Vec<String> = Vec::new();
        let mut pending: Option<(String, PendingCutover)> = None;

        for group in groups {
            info!(group = %group.id, subsystem = %group.subsystem, "Applying group");

            match self.apply_group(group, vars, ctx).await {
                Ok(Some(cutover)) => pending = Some((group.id.clone(), cutover)),
                Ok(None) => {}
                Err(e) => {
                    warn!(group = %group.id, error = %e, "Group failed, stopping");
                    if let Some((id, cutover)) = pending.take() {
                        self.coordinator.abandon(cutover);
                        ctx.update(Subsystem::RemoteAccess, &Outcome::Staged, Outcome::Abandoned);
                        committed.retain(|g| *g != id);
                    }

                    if committed.is_empty() {
                        return Err(e);
                    }
                    return Err(HardenError::ProfileApplicationFailed {
                        group: group.id.clone(),
                        committed,
                        cause: Box::new(e),
                    });
                }
            }

            committed.push(group.id.clone());
        }

        Ok(ApplyReport {
            committed,
            pending: pending.map(|(_, cutover)| cutover),
        })
    }

    async fn apply_group(
        &self,
        group: &ConfigGroup,
        vars: &Variables,
        ctx: &mut RunContext,
    ) -> Result<Option<PendingCutover>> {
        // Render the whole group before writing any of it
        let mut rendered = Vec::with_capacity(group.items.len());
        for item in &group.items {
            match self.renderer.render(&item.template_id, &item.required_vars, vars) {
                Ok(bytes) => rendered.push(bytes),
                Err(e) => {
                    ctx.record(
                        &group.id,
                        group.subsystem,
                        &item.target,
                        Outcome::NotRendered {
                            reason: e.to_string(),
                        },
                    );
                    return Err(e);
                }
            }
        }

        let mut owners: Vec<FileOwner> = Vec::with_capacity(group.items.len());
        for item in &group.items {
            if !ctx.managed.may_write(&item.target) {
                return Err(HardenError::Snapshot {
                    message: format!(
                        "{} has no captured pre-state; refusing to install",
                        item.target.display()
                    ),
                });
            }
            owners.push(item.owner.resolve()?);
        }

        let validation = group.subsystem.validation();

        // Kernel parameters are checked from the rendered text before any write.
        // Reads /proc only, so it also runs in dry-run mode.
        if validation == ValidationSpec::KernelParameters {
            if let Err(output) = check_rendered_parameters(&ctx.proc_sys, &rendered) {
                self.record_all(group, ctx, Outcome::ValidationFailed {
                    output: output.clone(),
                });
                return Err(HardenError::ValidationFailed {
                    subsystem: group.subsystem.to_string(),
                    output,
                });
            }
        }

        let staging = validation.uses_staging();

        let mut written: Vec<StagedFile> = Vec::with_capacity(group.items.len());
        for ((item, bytes), owner) in group.items.iter().zip(&rendered).zip(owners) {
            let dest = ctx.host_path(&item.target);
            let path = if staging { staged_path(&dest) } else { dest.clone() };

            if let Err(e) = self.deployer.install(bytes, &path, item.mode, Some(owner)) {
                ctx.record(
                    &group.id,
                    group.subsystem,
                    &item.target,
                    Outcome::InstallFailed {
                        reason: e.to_string(),
                    },
                );
                if staging {
                    self.discard(&written);
                }
                return Err(e);
            }
            written.push(StagedFile { staged: path, dest });
        }

        if validation == ValidationSpec::RemoteAccess {
            return match self.coordinator.validate(PendingCutover::new(written)).await {
                Ok(pending) => {
                    self.record_all(group, ctx, Outcome::Staged);
                    Ok(Some(pending))
                }
                Err(e) => {
                    let output = match &e {
                        HardenError::ValidationFailed { output, .. } => output.clone(),
                        other => other.to_string(),
                    };
                    self.record_all(group, ctx, Outcome::ValidationFailed { output });
                    Err(e)
                }
            };
        }

        if let Err(output) = self.validate(&validation, &written, ctx).await {
            if staging {
                self.discard(&written);
            }
            self.record_all(group, ctx, Outcome::ValidationFailed {
                output: output.clone(),
            });
            return Err(HardenError::ValidationFailed {
                subsystem: group.subsystem.to_string(),
                output,
            });
        }

        if staging {
            for file in &written {
                self.deployer.promote(&file.staged, &file.dest)?;
            }
        }

        let outcome = if self.deployer.is_dry_run() {
            Outcome::WouldInstall
        } else {
            Outcome::Installed
        };
        self.record_all(group, ctx, outcome);

        self.activate(group).await?;
        Ok(None)
    }

    /// Run the subsystem's test. `Err` carries the raw diagnostic.
    async fn validate(
        &self,
        validation: &ValidationSpec,
        written: &[StagedFile],
        ctx: &RunContext,
    ) -> std::result::Result<(), String> {
        match validation {
            ValidationSpec::None | ValidationSpec::KernelParameters | ValidationSpec::RemoteAccess => Ok(()),
            ValidationSpec::StagedCommand(argv) => {
                for file in written {
                    let Some(spec) = validation_command(argv, &file.staged) else {
                        continue;
                    };
                    self.run_check(spec).await?;
                }
                Ok(())
            }
            ValidationSpec::InstalledCommand(argv) => match validation_command(argv, &ctx.root) {
                Some(spec) => self.run_check(spec).await,
                None => Ok(()),
            },
        }
    }

    async fn run_check(&self, spec: crate::runner::CommandSpec) -> std::result::Result<(), String> {
        if self.deployer.is_dry_run() {
            info!(command = %spec, "[DRY RUN] Would validate");
            return Ok(());
        }

        match self.runner.run(&spec).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.diagnostic()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Make a validated group live.
    async fn activate(&self, group: &ConfigGroup) -> Result<()> {
        let Some(spec) = group.subsystem.service_action(self.ssh) else {
            return Ok(());
        };

        if self.deployer.is_dry_run() {
            info!(command = %spec, "[DRY RUN] Would run");
            return Ok(());
        }

        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(HardenError::CommandFailed {
                command: spec.to_string(),
                message: out.diagnostic(),
            });
        }
        info!(group = %group.id, command = %spec, "Group is live");
        Ok(())
    }

    fn discard(&self, written: &[StagedFile]) {
        for file in written {
            self.deployer.discard(&file.staged);
        }
    }

    fn record_all(&self, group: &ConfigGroup, ctx: &mut RunContext, outcome: Outcome) {
        for item in &group.items {
            ctx.record(&group.id, group.subsystem, &item.target, outcome.clone());
        }
    }
}

fn check_rendered_parameters(proc_sys: &Path, rendered: &[Vec<u8>]) -> std::result::Result<(), String> {
    for content in rendered {
        check_kernel_parameters(proc_sys, &String::from_utf8_lossy(content))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn targets(groups: &[ConfigGroup]) -> Vec<PathBuf> {
        groups
            .iter()
            .flat_map(|g| g.items.iter().map(|i| i.target.clone()))
            .collect()
    }

    #[test]
    fn test_profiles_are_cumulative() {
        let minimal = targets(&resolve(Profile::Minimal, &[]));
        let standard = targets(&resolve(Profile::Standard, &[]));
        let hardened = targets(&resolve(Profile::Hardened, &[]));

        let set = |v: &[PathBuf]| v.iter().cloned().collect::<BTreeSet<_>>();
        assert!(set(&minimal).is_subset(&set(&standard)));
        assert!(set(&standard).is_subset(&set(&hardened)));
        assert!(hardened.len() > standard.len() && standard.len() > minimal.len());

        // Lower levels form a prefix of higher ones
        assert_eq!(&standard[..minimal.len()], &minimal[..]);
        assert_eq!(&hardened[..standard.len()], &standard[..]);
    }

    #[test]
    fn test_modes_filter_groups() {
        let groups = resolve(Profile::Hardened, &[Mode::Ssh]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].subsystem, Subsystem::RemoteAccess);

        let groups = resolve(Profile::Minimal, &[Mode::Web]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_variable_layering() {
        let mut operator = Variables::new();
        operator.insert("SSH_MAX_AUTH_TRIES".into(), "2".into());
        operator.insert("SSH_PORT".into(), "9999".into());

        let vars = layered_variables(Profile::Standard, &operator, 2222);
        assert_eq!(vars["SSH_MAX_AUTH_TRIES"], "2");
        // The run's port always wins
        assert_eq!(vars["SSH_PORT"], "2222");
        assert_eq!(vars["SSH_PASSWORD_AUTH"], "no");
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("Hardened".parse::<Profile>().unwrap(), Profile::Hardened);
        assert!("paranoid".parse::<Profile>().is_err());
        assert!(Profile::Hardened.includes(Profile::Minimal));
        assert!(!Profile::Minimal.includes(Profile::Standard));
    }

    #[test]
    fn test_items_carry_subsystem_validation() {
        let groups = resolve(Profile::Minimal, &[Mode::Ssh]);
        assert_eq!(groups[0].items[0].validation, ValidationSpec::RemoteAccess);
        assert_eq!(groups[0].items[0].mode, 0o600);
    }
}
