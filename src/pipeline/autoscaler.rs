//! Cluster autoscaler on the head node
//!
//! The autoscaler ships as a zip plus its Python dependencies. It reads
//! `autoscale.json` for the orchestrator connection and is run every minute
//! by a scheduled task.

use crate::config::NodeConfig;
use crate::node::{NodeEnv, NodeStep, transient};
use crate::platform::ScheduledTask;
use convergence::ActionResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

const CONFIG_FILE: &str = "autoscale.json";
const UNPACKED_DIR: &str = "hpcpack-autoscaler";
const LAUNCHER: &str = r"bin\start-autoscaler.ps1";
const PEM_FILE: &str = "hpc-comm.pem";

#[derive(Debug, Serialize)]
struct AutoscaleFile<'a> {
    cyclecloud: CycleCloudSection<'a>,
    hpcpack: HpcPackSection,
    min_counts: BTreeMap<&'static str, u32>,
    autoscale: AutoscaleSection,
    job: JobSection,
}

#[derive(Debug, Serialize)]
struct CycleCloudSection<'a> {
    cluster_name: Option<&'a str>,
    url: Option<&'a str>,
    username: Option<&'a str>,
    password: Option<&'a str>,
    verify_certificates: bool,
}

#[derive(Debug, Serialize)]
struct HpcPackSection {
    pem: String,
    hn_hostname: String,
}

#[derive(Debug, Serialize)]
struct AutoscaleSection {
    start_enabled: bool,
    deallocate: bool,
    idle_time_after_jobs: u64,
    provisioning_timeout: u64,
    max_deallocated_nodes: u32,
}

#[derive(Debug, Serialize)]
struct JobSection {
    default_runtime: u64,
    add_node_threshold: u64,
}

fn config_path(env: &NodeEnv) -> PathBuf {
    env.config.bootstrap_dir().join(CONFIG_FILE)
}

/// Render `autoscale.json`.
///
/// Only the orchestrator connection is written; the domain admin and
/// certificate secrets never are.
fn render(env: &NodeEnv) -> anyhow::Result<Vec<u8>> {
    let autoscale = &env.config.autoscale;
    let cc = &autoscale.cyclecloud;

    let file = AutoscaleFile {
        cyclecloud: CycleCloudSection {
            cluster_name: cc.cluster_name.as_deref(),
            url: cc.url.as_deref(),
            username: cc.username.as_deref(),
            password: cc.password.as_deref(),
            verify_certificates: cc.verify_certificates,
        },
        hpcpack: HpcPackSection {
            pem: env
                .config
                .bootstrap_dir()
                .join(PEM_FILE)
                .display()
                .to_string(),
            hn_hostname: env.hostname.clone(),
        },
        min_counts: BTreeMap::from([("default", env.config.cluster.min_node_count)]),
        autoscale: AutoscaleSection {
            start_enabled: autoscale.start_enabled,
            deallocate: autoscale.deallocate,
            idle_time_after_jobs: autoscale.idle_time_after_jobs,
            provisioning_timeout: autoscale.provisioning_timeout,
            max_deallocated_nodes: autoscale.max_deallocated_nodes,
        },
        job: JobSection {
            default_runtime: env.config.cluster.job.default_runtime,
            add_node_threshold: env.config.cluster.job.add_node_threshold,
        },
    };

    let mut json = serde_json::to_vec_pretty(&file)?;
    json.push(b'\n');
    Ok(json)
}

fn task_command(env: &NodeEnv) -> String {
    if let Some(command) = &env.config.autoscale.command {
        return command.clone();
    }
    let bootstrap = env.config.bootstrap_dir();
    format!(
        "powershell.exe -NoProfile -ExecutionPolicy Bypass -File \"{}\" -ConfigFile \"{}\"",
        bootstrap.join(UNPACKED_DIR).join(LAUNCHER).display(),
        config_path(env).display()
    )
}

fn enabled(env: &NodeEnv) -> anyhow::Result<bool> {
    Ok(env.config.autoscale.start_enabled)
}

pub fn steps(config: &NodeConfig) -> Vec<NodeStep> {
    let mut steps: Vec<NodeStep> = config
        .autoscale
        .packages
        .iter()
        .map(|package| {
            let name = package.clone();
            let probe_name = package.clone();
            NodeStep::new(
                format!("fetch-autoscaler-{}", package.to_ascii_lowercase()),
                format!("Download {package}"),
                move |env| {
                    env.packages
                        .download(&name, &env.config.bootstrap_dir())
                        .map_err(transient)?;
                    Ok(ActionResult::Done)
                },
            )
            .only_if("autoscaling is enabled", enabled)
            .not_if(format!("{package} is present"), move |env| {
                Ok(env
                    .probe
                    .file_exists(&env.config.bootstrap_dir().join(&probe_name)))
            })
            .retry(config.retries.download.policy())
        })
        .collect();

    if let Some(archive) = config.autoscale.archive() {
        let archive = archive.to_string();
        steps.push(
            NodeStep::new("unpack-autoscaler", "Unpack the autoscaler", move |env| {
                let bootstrap = env.config.bootstrap_dir();
                env.packages.unpack(&bootstrap.join(&archive), &bootstrap)?;
                Ok(ActionResult::Done)
            })
            .only_if("autoscaling is enabled", enabled)
            .not_if("autoscaler is unpacked", |env| {
                Ok(env
                    .probe
                    .file_exists(&env.config.bootstrap_dir().join(UNPACKED_DIR)))
            }),
        );
    }

    steps.push(
        NodeStep::new(
            "write-autoscale-config",
            "Write the autoscaler configuration",
            |env| {
                env.ops.write_file(&config_path(env), &render(env)?)?;
                Ok(ActionResult::Done)
            },
        )
        .only_if("autoscaling is enabled", enabled)
        .not_if("autoscale.json is up to date", |env| {
            let Some(current) = env.probe.read_file(&config_path(env))? else {
                return Ok(false);
            };
            Ok(blake3::hash(&current) == blake3::hash(&render(env)?))
        }),
    );

    steps.push(
        NodeStep::new(
            "register-autoscale-task",
            "Schedule the autoscaler every minute",
            |env| {
                env.ops.register_task(&autoscale_task(env))?;
                Ok(ActionResult::Done)
            },
        )
        .only_if("autoscaling is enabled", enabled)
        .not_if("autoscale task is registered", |env| {
            let expected = autoscale_task(env);
            Ok(env
                .probe
                .scheduled_task(&expected.name)?
                .is_some_and(|task| task.matches(&expected)))
        }),
    );

    steps
}

fn autoscale_task(env: &NodeEnv) -> ScheduledTask {
    ScheduledTask {
        name: env.config.autoscale.task_name.clone(),
        command: task_command(env),
        every_minutes: 1,
        run_as: Some((env.domain_admin(), env.credentials.admin_password.clone())),
    }
}
