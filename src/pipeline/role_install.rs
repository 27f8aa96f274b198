//! HPC Pack installation and cluster registration per role

use crate::config::NodeConfig;
use crate::node::{NodeEnv, NodeStep, installer_outcome, transient};
use crate::platform::{
    BrokerCertificate, BrokerNodeInstall, ClusterNode, ComputeNodeInstall, HeadNodeInstall,
    NodeHealth, NodeState, ScheduledTask,
};
use crate::role::Role;
use convergence::{ActionResult, StepError};
use std::path::PathBuf;
use std::time::Duration;

const HPC_SERVICE: &str = "HpcManagement";
const CUSTOM_PROPERTIES_VAR: &str = "HPC_NodeCustomProperties";
const COMPUTE_SCRIPT: &str = "InstallHPCComputeNode.ps1";
const SETUP_EXE: &str = "Setup.exe";
/// What the broker installer needs from the head node's install share
const SHARE_ENTRIES: [&str; 5] = ["amd64", "i386", "MPI", "Setup", SETUP_EXE];

const VERIFY_ONLINE_TASK: &str = "HPCNodeVerifyOnline";
const VERIFY_ONLINE_SCRIPT: &str = "bring-hpc-node-online.ps1";
const VERIFY_ONLINE_MINUTES: u32 = 5;

/// Steps of the main phase and of the deferred phase
#[derive(Default)]
pub struct RoleSteps {
    pub main: Vec<NodeStep>,
    pub deferred: Vec<NodeStep>,
}

pub fn steps(role: Role, config: &NodeConfig) -> RoleSteps {
    match role {
        Role::DomainController => RoleSteps::default(),
        Role::HeadNode => head_node(config),
        Role::ComputeNode => compute_node(config),
        Role::BrokerNode => broker_node(config),
    }
}

// ============================================================================
// Shared probes and steps
// ============================================================================

fn this_node(env: &NodeEnv) -> anyhow::Result<Option<ClusterNode>> {
    env.cluster.node(&env.hostname)
}

fn service_exists(env: &NodeEnv) -> anyhow::Result<bool> {
    Ok(env.probe.service_status(HPC_SERVICE)?.exists())
}

fn service_running(env: &NodeEnv) -> anyhow::Result<bool> {
    Ok(env.probe.service_status(HPC_SERVICE)? == crate::platform::ServiceStatus::Running)
}

fn node_state_is(env: &NodeEnv, state: &NodeState) -> anyhow::Result<bool> {
    Ok(this_node(env)?.is_some_and(|n| &n.state == state))
}

/// Download `name` into the bootstrap directory unless it is already there
fn fetch_to_bootstrap(id: &str, name: &str, config: &NodeConfig) -> NodeStep {
    let fetch_name = name.to_string();
    let probe_name = name.to_string();
    NodeStep::new(id, format!("Download {name}"), move |env| {
        env.packages
            .download(&fetch_name, &env.config.bootstrap_dir())
            .map_err(transient)?;
        Ok(ActionResult::Done)
    })
    .not_if(format!("{name} is present"), move |env| {
        Ok(env
            .probe
            .file_exists(&env.config.bootstrap_dir().join(&probe_name)))
    })
    .retry(config.retries.download.policy())
}

fn wait_registered(config: &NodeConfig) -> NodeStep {
    NodeStep::new(
        "wait-node-registered",
        "Wait for the node to appear in the HPC cluster",
        |env| match this_node(env).map_err(transient)? {
            Some(_) => Ok(ActionResult::Done),
            None => Err(StepError::transient(format!(
                "{} is not registered with {} yet",
                env.hostname,
                env.scheduler()
            ))),
        },
    )
    .not_if("node is registered", |env| Ok(this_node(env)?.is_some()))
    .retry(config.retries.node_registration.policy())
    .on_exhaustion("Node not shown in the HPC cluster")
}

fn assign_template(template: &str, config: &NodeConfig) -> NodeStep {
    let template = template.to_string();
    let probe_template = template.clone();
    NodeStep::new(
        "assign-node-template",
        format!("Assign the '{template}' node template"),
        move |env| {
            env.cluster
                .assign_template(&env.hostname, &template)
                .map_err(transient)?;
            Ok(ActionResult::Done)
        },
    )
    .only_if("node is Unapproved", |env| {
        Ok(this_node(env)?.is_some_and(|n| n.health == NodeHealth::Unapproved))
    })
    .only_if(format!("'{probe_template}' exists"), move |env| {
        env.cluster.template_exists(&probe_template)
    })
    .retry(config.retries.cluster_command.policy())
}

fn wait_offline(config: &NodeConfig) -> NodeStep {
    NodeStep::new(
        "wait-node-offline",
        "Wait for the node to reach the Offline state",
        |env| match this_node(env).map_err(transient)? {
            Some(node) if node.state == NodeState::Offline => Ok(ActionResult::Done),
            Some(node) => Err(StepError::transient(format!(
                "{} is still in state {:?}",
                env.hostname, node.state
            ))),
            None => Err(StepError::transient(format!(
                "{} is no longer listed by the scheduler",
                env.hostname
            ))),
        },
    )
    .not_if("node is Online", |env| node_state_is(env, &NodeState::Online))
    .retry(config.retries.offline_wait.policy())
    .on_exhaustion("Timed out waiting for Offline state")
    // HPC Pack 2012 rejects the Online transition right after Offline
    .settle_after(Duration::from_secs(config.cluster.offline_settle_secs))
}

fn bring_online(config: &NodeConfig) -> NodeStep {
    NodeStep::new("bring-node-online", "Bring the node Online", |env| {
        log::info!("Bringing {} online", env.hostname);
        env.cluster
            .set_node_state(&env.hostname, true)
            .map_err(transient)?;
        Ok(ActionResult::Done)
    })
    .not_if("node is Online", |env| node_state_is(env, &NodeState::Online))
    .retry(config.retries.cluster_command.policy())
}

// ============================================================================
// Head node
// ============================================================================

fn cluster_setting(id: &str, name: &'static str, value: u32, config: &NodeConfig) -> NodeStep {
    let expected = value.to_string();
    let probe_expected = expected.clone();
    NodeStep::new(id, format!("Set cluster {name} to {value}"), move |env| {
        env.cluster
            .set_cluster_property(name, &expected)
            .map_err(transient)?;
        Ok(ActionResult::Done)
    })
    .not_if(format!("{name} is {value}"), move |env| {
        Ok(env.cluster.cluster_property(name)?.as_deref() == Some(probe_expected.as_str()))
    })
    .retry(config.retries.cluster_command.policy())
}

fn head_node(config: &NodeConfig) -> RoleSteps {
    let main = vec![
        fetch_to_bootstrap(
            "fetch-head-node-script",
            &config.packages.head_node_script,
            config,
        ),
        NodeStep::new("install-head-node", "Install the HPC Pack head node", |env| {
            let install = HeadNodeInstall {
                script: env
                    .config
                    .bootstrap_dir()
                    .join(&env.config.packages.head_node_script),
                setup_file: env.config.install_dir().join(SETUP_EXE),
                cluster_name: env.hostname.clone(),
                pfx: env.config.cert_path(),
                pfx_password: env.credentials.cert_password.clone(),
                domain_user: env.domain_admin(),
                domain_password: env.credentials.admin_password.clone(),
            };
            let code = env.ops.install_head_node(&install)?;
            installer_outcome("HPC Pack head node setup", code)
        })
        .not_if("HpcManagement service exists", service_exists),
        cluster_setting(
            "set-heartbeat-interval",
            "HeartbeatInterval",
            config.cluster.heartbeat_interval,
            config,
        ),
        cluster_setting(
            "set-inactivity-count",
            "InactivityCount",
            config.cluster.inactivity_count,
            config,
        ),
    ];

    RoleSteps {
        main,
        deferred: Vec::new(),
    }
}

// ============================================================================
// Compute node
// ============================================================================

fn compute_installer(env: &NodeEnv) -> PathBuf {
    env.config
        .downloads_dir()
        .join(&env.config.packages.compute_installer)
}

fn verify_online_script(scheduler: &str) -> String {
    let scheduler = scheduler.replace('\'', "''");
    format!(
        "Add-PSSnapin Microsoft.HPC\r\n\
         $node = Get-HpcNode -Name $env:COMPUTERNAME -Scheduler '{scheduler}'\r\n\
         if ($node.NodeState -ne 'Online') {{\r\n\
         \x20   Set-HpcNodeState -Name $env:COMPUTERNAME -State Online -Scheduler '{scheduler}'\r\n\
         }}\r\n"
    )
}

fn compute_node(config: &NodeConfig) -> RoleSteps {
    let mut main = Vec::new();

    if let Some(instance_id) = config.node.instance_id.clone() {
        let probe_id = instance_id.clone();
        main.push(
            NodeStep::new(
                "set-node-custom-properties",
                "Publish the instance id to the HPC node agent",
                move |env| {
                    env.ops.set_machine_env(CUSTOM_PROPERTIES_VAR, &instance_id)?;
                    Ok(ActionResult::Done)
                },
            )
            .not_if("HPC_NodeCustomProperties is set", move |env| {
                Ok(env.probe.machine_env(CUSTOM_PROPERTIES_VAR)?.as_deref() == Some(probe_id.as_str()))
            }),
        );
    }

    main.push(
        NodeStep::new(
            "fetch-compute-installer",
            "Download the compute node installer",
            |env| {
                env.packages
                    .download(
                        &env.config.packages.compute_installer,
                        &env.config.downloads_dir(),
                    )
                    .map_err(transient)?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("installer is cached", |env| {
            Ok(env.probe.file_exists(&compute_installer(env)))
        })
        .retry(config.retries.download.policy()),
    );

    main.push(
        NodeStep::new(
            "unpack-compute-installer",
            "Unpack the compute node installer",
            |env| {
                env.packages
                    .unpack(&compute_installer(env), &env.config.media_dir())?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("installer is unpacked", |env| {
            Ok(env
                .probe
                .file_exists(&env.config.media_dir().join(COMPUTE_SCRIPT)))
        })
        .not_if("HpcManagement is running", service_running),
    );

    main.push(
        NodeStep::new(
            "install-compute-node",
            "Install the HPC Pack compute node",
            |env| {
                let install = ComputeNodeInstall {
                    script: env.config.media_dir().join(COMPUTE_SCRIPT),
                    connection_string: env.head_node_name()?.to_string(),
                    pfx: env.config.cert_path(),
                    pfx_password: env.credentials.cert_password.clone(),
                };
                let code = env.ops.install_compute_node(&install)?;
                installer_outcome("HPC Pack compute node setup", code)
            },
        )
        .not_if("HpcManagement is running", service_running),
    );

    main.push(wait_registered(config));
    main.push(assign_template(&config.cluster.compute_template, config));

    if config.node.group_id.is_some() && config.node.instance_id.is_some() {
        main.push(
            NodeStep::new(
                "set-node-location",
                "Record the node's group and instance as its location",
                |env| {
                    let (Some(group), Some(instance)) =
                        (&env.config.node.group_id, &env.config.node.instance_id)
                    else {
                        return Err(StepError::configuration(
                            "node.group_id and node.instance_id are required for the location",
                        ));
                    };
                    env.cluster
                        .set_node_location(&env.hostname, group, instance)
                        .map_err(transient)?;
                    Ok(ActionResult::Done)
                },
            )
            .only_if("node has no location", |env| {
                Ok(this_node(env)?.is_some_and(|n| n.location.trim().is_empty()))
            })
            .retry(config.retries.cluster_command.policy()),
        );
    }

    main.push(wait_offline(config));

    let deferred = vec![
        bring_online(config),
        NodeStep::new(
            "write-verify-online-script",
            "Write the script that keeps the node Online",
            |env| {
                let path = env.config.bootstrap_dir().join(VERIFY_ONLINE_SCRIPT);
                env.ops
                    .write_file(&path, verify_online_script(env.scheduler()).as_bytes())?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("script is up to date", |env| {
            let path = env.config.bootstrap_dir().join(VERIFY_ONLINE_SCRIPT);
            let current = env.probe.read_file(&path)?;
            Ok(current.as_deref() == Some(verify_online_script(env.scheduler()).as_bytes()))
        }),
        NodeStep::new(
            "register-verify-online-task",
            "Schedule the periodic Online check",
            |env| {
                env.ops.register_task(&verify_online_task(env))?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("HPCNodeVerifyOnline task is registered", |env| {
            let expected = verify_online_task(env);
            Ok(env
                .probe
                .scheduled_task(&expected.name)?
                .is_some_and(|task| task.matches(&expected)))
        }),
    ];

    RoleSteps { main, deferred }
}

fn verify_online_task(env: &NodeEnv) -> ScheduledTask {
    let script = env.config.bootstrap_dir().join(VERIFY_ONLINE_SCRIPT);
    ScheduledTask {
        name: VERIFY_ONLINE_TASK.to_string(),
        command: format!(
            "powershell.exe -NoProfile -ExecutionPolicy Bypass -File \"{}\"",
            script.display()
        ),
        every_minutes: VERIFY_ONLINE_MINUTES,
        run_as: Some((env.domain_admin(), env.credentials.admin_password.clone())),
    }
}

// ============================================================================
// Broker node
// ============================================================================

fn broker_node(config: &NodeConfig) -> RoleSteps {
    let template = config.cluster.broker_template.clone();
    let probe_template = template.clone();

    let main = vec![
        fetch_to_bootstrap(
            "fetch-broker-node-script",
            &config.packages.broker_node_script,
            config,
        ),
        NodeStep::new(
            "copy-broker-installer",
            "Copy the installer from the head node share",
            |env| {
                let share = PathBuf::from(format!(r"\\{}\REMINST", env.head_node_name()?));
                let copied = env
                    .packages
                    .copy_tree(&share, &env.config.media_dir(), &SHARE_ENTRIES)
                    .map_err(|e| {
                        StepError::transient(format!("head node not available: {e:#}"))
                    })?;
                log::info!("Copied {copied} files from {}", share.display());
                Ok(ActionResult::Done)
            },
        )
        .not_if("Setup.exe is present", |env| {
            Ok(env.probe.file_exists(&env.config.media_dir().join(SETUP_EXE)))
        })
        .retry(config.retries.head_node_share.policy())
        .on_exhaustion("head node not available"),
        NodeStep::new(
            "install-broker-node",
            "Install the HPC Pack broker node",
            |env| {
                let certificate = match (
                    &env.config.keyvault.vault_name,
                    &env.config.keyvault.cert_name,
                ) {
                    (Some(vault), Some(cert_name)) => BrokerCertificate::Vault {
                        vault: vault.clone(),
                        cert_name: cert_name.clone(),
                    },
                    _ => BrokerCertificate::Pfx {
                        path: env.config.cert_path(),
                        password: env.credentials.cert_password.clone(),
                    },
                };
                let install = BrokerNodeInstall {
                    script: env
                        .config
                        .bootstrap_dir()
                        .join(&env.config.packages.broker_node_script),
                    setup_file: env.config.media_dir().join(SETUP_EXE),
                    head_node: env.head_node_name()?.to_string(),
                    certificate,
                };
                let code = env.ops.install_broker_node(&install)?;
                installer_outcome("HPC Pack broker node setup", code)
            },
        )
        .not_if("HpcManagement service exists", service_exists),
        NodeStep::new(
            "wait-broker-template",
            format!("Wait for the '{template}' node template"),
            move |env| {
                if env.cluster.template_exists(&template).map_err(transient)? {
                    Ok(ActionResult::Done)
                } else {
                    Err(StepError::transient(format!(
                        "node template '{template}' not found on {}",
                        env.scheduler()
                    )))
                }
            },
        )
        .not_if(format!("'{probe_template}' exists"), {
            let probe_template = probe_template.clone();
            move |env| env.cluster.template_exists(&probe_template)
        })
        .retry(config.retries.template_lookup.policy())
        .on_exhaustion("Node template never appeared")
        .ignore_failure(),
        wait_registered(config),
        assign_template(&probe_template, config),
        wait_offline(config),
    ];

    RoleSteps {
        main,
        deferred: vec![bring_online(config)],
    }
}
