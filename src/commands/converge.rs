//! One convergence pass against the local machine

use anyhow::{Context as _, Result};
use colored::Colorize;
use convergence::{
    Driver, DriverOptions, FileStateStore, PassOutcome, PassSummary, Pipeline, StepReport,
    SystemClock,
};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::Context;
use crate::config::NodeConfig;
use crate::node::NodeEnv;
use crate::paths;
use crate::pipeline;
use crate::platform::{
    ClusterManager, CommandLocator, HeadNode, HeadNodeLocator, KeyVault, Operations,
    PackageCache, PackageFetcher, PowerShellNode, SecretStore, SystemProbe, WindowsReboot,
};
use crate::progress::PassProgress;
use crate::role::Role;
use crate::secrets::Credentials;
use crate::ui;

/// Machine-facing collaborators of a pass
pub struct Collaborators {
    pub probe: Rc<dyn SystemProbe>,
    pub ops: Rc<dyn Operations>,
    pub cluster: Rc<dyn ClusterManager>,
    pub packages: Rc<dyn PackageFetcher>,
}

/// Everything a pass over the local machine needs
pub struct Session {
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub env: NodeEnv,
    pub pipeline: Pipeline<NodeEnv>,
}

impl Session {
    /// Load the config and resolve the role, secrets and head node
    pub fn open(ctx: &Context, role: Option<Role>) -> Result<Self> {
        let config_path = paths::config_file(ctx.config.as_deref())?;
        let config = NodeConfig::load(&config_path)?;
        let role = config.resolve_role(role)?;
        let state_dir = paths::state_dir(ctx.state_dir.as_deref())?;

        let env = prepare(
            config,
            role,
            &KeyVault::new(),
            &CommandLocator,
            connect_windows,
        )?;
        let pipeline = pipeline::for_role(role, &env.config)?;

        Ok(Self {
            config_path,
            state_dir,
            env,
            pipeline,
        })
    }

    pub fn store(&self) -> FileStateStore {
        FileStateStore::new(&self.state_dir)
    }

    pub fn options(&self, dry_run: bool, allow_reboot: bool) -> DriverOptions {
        let mut options = DriverOptions::new(paths::lock_file(&self.state_dir));
        options.dry_run = dry_run;
        options.allow_reboot = allow_reboot;
        options.stale_lock_after = stale_lock_after(&self.env.config);
        options
    }

    /// Boot task and restart for this node
    pub fn reboot(&self) -> Result<WindowsReboot> {
        let command = reentry_command(&self.env.config, &self.config_path, self.env.role)?;
        Ok(WindowsReboot::new(&self.env.config.reentry.task_name, &command))
    }
}

pub fn run(ctx: &Context, role: Option<Role>, dry_run: bool, no_reboot: bool) -> Result<()> {
    let session = Session::open(ctx, role)?;
    let store = session.store();
    let reboot = session.reboot()?;
    let options = session.options(dry_run, !no_reboot);

    if !ctx.quiet {
        ui::header(&format!(
            "{} {} on {}",
            if dry_run { "Planning" } else { "Converging" },
            session.env.role,
            session.env.hostname
        ));
        if ctx.verbose > 0 {
            ui::kv("Config", &session.config_path.display().to_string());
            ui::kv("State dir", &session.state_dir.display().to_string());
        }
    }

    let outcome = {
        let mut progress = PassProgress::new(ctx.quiet);
        Driver::new(
            &session.pipeline,
            &session.env,
            &store,
            &reboot,
            &SystemClock,
            options,
        )
        .run(&mut progress)?
    };

    report(ctx, &outcome, dry_run, no_reboot);
    Ok(())
}

/// Resolve everything a pass needs before the first step runs.
///
/// The config is validated, then secrets are read and the head node located.
/// Any failure here is a configuration error and nothing on the machine has
/// been touched.
pub fn prepare<F>(
    config: NodeConfig,
    role: Role,
    secrets: &dyn SecretStore,
    locator: &dyn HeadNodeLocator,
    connect: F,
) -> Result<NodeEnv>
where
    F: FnOnce(&NodeConfig, Role, Option<&HeadNode>, &Credentials) -> Result<Collaborators>,
{
    config
        .validate(role)
        .map_err(|e| convergence::Error::Configuration {
            message: format!("{e:#}"),
        })?;

    let credentials = Credentials::resolve(&config, secrets)?;

    let head_node = if role.needs_head_node() {
        let found =
            locator
                .locate(&config.head_node)
                .map_err(|e| convergence::Error::Configuration {
                    message: format!("head node could not be resolved: {e:#}"),
                })?;
        Some(found)
    } else {
        None
    };

    let collaborators = connect(&config, role, head_node.as_ref(), &credentials)?;
    let hostname = collaborators
        .probe
        .hostname()
        .context("Failed to read the hostname")?;
    log::info!("Preparing {role} pass on {hostname}");

    Ok(NodeEnv {
        config,
        role,
        hostname,
        head_node,
        credentials,
        probe: collaborators.probe,
        ops: collaborators.ops,
        cluster: collaborators.cluster,
        packages: collaborators.packages,
    })
}

/// PowerShell-backed collaborators for this machine
fn connect_windows(
    config: &NodeConfig,
    role: Role,
    head_node: Option<&HeadNode>,
    credentials: &Credentials,
) -> Result<Collaborators> {
    let local = PowerShellNode::new();
    let node = match head_node {
        // Cluster cmdlets on a member node run as the domain admin
        Some(hn) => local.with_scheduler(
            &hn.hostname,
            Some((
                credentials.domain_user(&config.ad.domain),
                credentials.admin_password.clone(),
            )),
        ),
        None if role == Role::HeadNode => {
            let hostname = local.hostname()?;
            local.with_scheduler(&hostname, None)
        }
        None => local,
    };

    let node = Rc::new(node);
    Ok(Collaborators {
        probe: node.clone(),
        ops: node.clone(),
        cluster: node,
        packages: Rc::new(PackageCache::new(
            &config.packages.source,
            config.packages.checksums.clone(),
        )),
    })
}

fn stale_lock_after(config: &NodeConfig) -> Duration {
    Duration::from_secs(config.reentry.stale_lock_hours.saturating_mul(3600))
}

/// Command the boot task runs to resume convergence
fn reentry_command(config: &NodeConfig, config_path: &Path, role: Role) -> Result<String> {
    if let Some(command) = &config.reentry.command {
        return Ok(command.clone());
    }
    let exe = std::env::current_exe().context("Could not determine the hpcnode executable")?;
    Ok(format!(
        "\"{}\" --config \"{}\" converge --role {role}",
        exe.display(),
        config_path.display()
    ))
}

fn report(ctx: &Context, outcome: &PassOutcome, dry_run: bool, no_reboot: bool) {
    match outcome {
        PassOutcome::Busy => {
            ui::info("Another pass is running on this node; nothing to do");
        }
        PassOutcome::Completed(summary) if dry_run => {
            if summary.would_apply() == 0 {
                ui::success("Node is converged; no step would run");
            } else {
                ui::info(&format!("{} step(s) would run", summary.would_apply()));
            }
        }
        PassOutcome::Completed(summary) => {
            if !ctx.quiet {
                println!();
            }
            ui::success(&format!("Converged: {}", counts(summary)));
            report_ignored(summary);
        }
        PassOutcome::RebootPending { step, summary } => {
            if !ctx.quiet {
                println!();
            }
            report_ignored(summary);
            if no_reboot {
                ui::warn(&format!(
                    "'{step}' needs a reboot; restart the machine and run converge again"
                ));
            } else {
                ui::warn(&format!(
                    "Rebooting after '{step}'; convergence resumes at boot"
                ));
            }
        }
    }
}

fn counts(summary: &PassSummary) -> String {
    let mut text = format!(
        "{} applied, {} skipped",
        summary.applied().to_string().green(),
        summary.skipped().to_string().dimmed()
    );
    if summary.failed() > 0 {
        text.push_str(&format!(
            ", {} failed (ignored)",
            summary.failed().to_string().yellow()
        ));
    }
    text
}

fn report_ignored(summary: &PassSummary) {
    for record in &summary.steps {
        if let StepReport::Failed { reason, .. } = &record.report {
            ui::warn(&format!("{} failed and was ignored: {reason}", record.id));
        }
    }
}
