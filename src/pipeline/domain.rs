//! Active Directory membership
//!
//! A node either joins the existing domain or, as a domain controller,
//! creates it. Both branches end in a reboot checkpoint so that the domain
//! change and any update removal share a single restart.

use crate::config::NodeConfig;
use crate::node::{NodeStep, transient, uninstall_outcome};
use crate::role::Role;
use anyhow::{Result, bail};
use convergence::ActionResult;
use regex::Regex;
use std::sync::OnceLock;

const ADMINISTRATORS: &str = "Administrators";

fn kb_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Optional KB prefix, then the 6 to 8 digit article number
    PATTERN.get_or_init(|| Regex::new(r"^(?i:kb)?(\d{6,8})$").unwrap())
}

/// Normalise `5005112`, `kb5005112` or `KB5005112` to `KB5005112`
pub fn normalize_kb(kb: &str) -> Result<String> {
    match kb_pattern().captures(kb.trim()) {
        Some(caps) => Ok(format!("KB{}", &caps[1])),
        None => bail!("'{kb}' is not a KB number"),
    }
}

/// Whether `role` creates the domain rather than joining it
pub fn promotes_domain(role: Role, head_node_as_dc: bool) -> bool {
    match role {
        Role::DomainController => true,
        Role::HeadNode => head_node_as_dc,
        Role::ComputeNode | Role::BrokerNode => false,
    }
}

fn contains_ignore_case(list: &[String], item: &str) -> bool {
    list.iter().any(|m| m.eq_ignore_ascii_case(item))
}

fn local_admin_steps() -> Vec<NodeStep> {
    vec![
        NodeStep::new(
            "set-local-admin-password",
            "Give the local admin account the domain admin password",
            |env| {
                env.ops.set_local_user_password(
                    env.credentials.admin_name.expose(),
                    &env.credentials.admin_password,
                )?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("machine is part of a domain", |env| {
            env.probe.part_of_domain()
        }),
        NodeStep::new(
            "add-local-admin-to-administrators",
            "Add the local admin account to Administrators",
            |env| {
                env.ops
                    .add_group_member(ADMINISTRATORS, env.credentials.admin_name.expose())?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("machine is part of a domain", |env| {
            env.probe.part_of_domain()
        })
        .not_if("local admin is an Administrator", |env| {
            let members = env.probe.group_members(ADMINISTRATORS)?;
            Ok(contains_ignore_case(
                &members,
                env.credentials.admin_name.expose(),
            ))
        }),
    ]
}

fn join_steps(config: &NodeConfig) -> Vec<NodeStep> {
    let mut steps = vec![
        NodeStep::new(
            "configure-dns-client",
            "Point the network adapters at the domain's DNS servers",
            |env| {
                env.ops.set_dns_client_servers(&env.dns_servers())?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("DNS servers already configured", |env| {
            Ok(env.probe.dns_client_servers()? == env.dns_servers())
        }),
    ];
    steps.extend(local_admin_steps());
    steps.push(
        NodeStep::new("join-domain", "Join the Active Directory domain", |env| {
            log::info!("Joining {} as {}", env.config.ad.domain, env.domain_admin());
            env.ops
                .join_domain(
                    &env.config.ad.domain,
                    &env.domain_admin(),
                    &env.credentials.admin_password,
                )
                .map_err(transient)?;
            Ok(ActionResult::Done)
        })
        .not_if("machine is part of a domain", |env| {
            env.probe.part_of_domain()
        })
        .retry(config.retries.domain_join.policy())
        .on_exhaustion("Failed to join the domain")
        .reboot_deferred(),
    );
    steps
}

fn promote_steps() -> Vec<NodeStep> {
    let mut steps = local_admin_steps();
    steps.push(
        NodeStep::new(
            "promote-domain-controller",
            "Create the domain and promote this node to domain controller",
            |env| {
                log::info!("Creating domain {}", env.config.ad.domain);
                env.ops.promote_domain_controller(
                    &env.config.ad.domain,
                    &env.credentials.admin_password,
                )?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("node is a domain controller", |env| {
            Ok(env.probe.domain_role()?.is_domain_controller())
        })
        .reboot_deferred(),
    );
    steps
}

fn uninstall_step(kb: String) -> NodeStep {
    let probe_kb = kb.clone();
    NodeStep::new(
        format!("uninstall-{}", kb.to_ascii_lowercase()),
        format!("Uninstall update {kb}"),
        move |env| {
            let code = env.ops.uninstall_update(&kb)?;
            uninstall_outcome(&kb, code)
        },
    )
    .only_if(format!("{probe_kb} is installed"), move |env| {
        env.probe.update_installed(&probe_kb)
    })
    .ignore_failure()
    .reboot_deferred()
}

/// Domain steps for `role`, up to and including the post-reboot fixups
pub fn steps(role: Role, config: &NodeConfig) -> convergence::Result<Vec<NodeStep>> {
    let promote = promotes_domain(role, config.head_node_as_dc);

    let mut steps = if promote {
        promote_steps()
    } else {
        join_steps(config)
    };

    for kb in &config.updates.uninstall {
        let kb = normalize_kb(kb).map_err(|e| convergence::Error::Configuration {
            message: format!("updates.uninstall: {e}"),
        })?;
        steps.push(uninstall_step(kb));
    }

    steps.push(NodeStep::reboot_checkpoint(
        "domain-reboot",
        "Reboot if the domain change or an update removal asked for it",
    ));

    if promote {
        steps.push(
            NodeStep::new(
                "configure-dns-forwarders",
                "Forward external names from the domain's DNS server",
                |env| {
                    let present = env.probe.dns_forwarders()?;
                    for forwarder in &env.config.ad.dns_forwarders {
                        if !present.contains(forwarder) {
                            env.ops.add_dns_forwarder(forwarder).map_err(transient)?;
                        }
                    }
                    Ok(ActionResult::Done)
                },
            )
            .not_if("DNS forwarders present", |env| {
                let present = env.probe.dns_forwarders()?;
                Ok(env
                    .config
                    .ad
                    .dns_forwarders
                    .iter()
                    .all(|f| present.contains(f)))
            })
            .retry(config.retries.cluster_command.policy()),
        );
    } else {
        steps.push(
            NodeStep::new(
                "add-domain-admin-to-administrators",
                "Add the domain admin to the local Administrators group",
                |env| {
                    env.ops
                        .add_group_member(ADMINISTRATORS, &env.domain_admin())
                        .map_err(transient)?;
                    Ok(ActionResult::Done)
                },
            )
            .not_if("domain admin is an Administrator", |env| {
                let members = env.probe.group_members(ADMINISTRATORS)?;
                Ok(contains_ignore_case(&members, &env.domain_admin()))
            })
            .retry(config.retries.cluster_command.policy()),
        );
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::harness::{Harness, pipeline};
    use crate::platform::DomainRole;
    use crate::platform::fake::FakeNode;
    use crate::node::NodeEnv;
    use convergence::{ErrorClass, PassOutcome, SkipReason, StepReport};

    fn domain_pipeline(env: &NodeEnv) -> convergence::Pipeline<NodeEnv> {
        pipeline(env.role.as_str(), steps(env.role, &env.config).unwrap())
    }

    #[test]
    fn test_normalize_kb() {
        assert_eq!(normalize_kb("KB5005112").unwrap(), "KB5005112");
        assert_eq!(normalize_kb("kb5005112").unwrap(), "KB5005112");
        assert_eq!(normalize_kb(" 5005112 ").unwrap(), "KB5005112");
        assert!(normalize_kb("KB").is_err());
        assert!(normalize_kb("KB50051x2").is_err());
        assert!(normalize_kb("").is_err());
    }

    #[test]
    fn test_promotes_domain() {
        assert!(promotes_domain(Role::DomainController, false));
        assert!(!promotes_domain(Role::HeadNode, false));
        assert!(promotes_domain(Role::HeadNode, true));
        assert!(!promotes_domain(Role::BrokerNode, true));
    }

    #[test]
    fn test_join_reboots_at_checkpoint_then_finishes() {
        let fake = FakeNode::new("cn-01");
        let env = fake.env(Role::ComputeNode);
        let p = domain_pipeline(&env);
        let h = Harness::new();

        let first = h.run(&p, &env, &fake).unwrap();
        assert!(
            matches!(first, PassOutcome::RebootPending { ref step, .. } if step == "domain-reboot")
        );
        assert!(fake.world().part_of_domain);
        assert_eq!(fake.world().dns_servers, vec!["10.0.0.4", "8.8.8.8"]);
        assert!(!fake.did("add-member Administrators hpc.local"));

        fake.clear_actions();
        h.converge(&p, &env, &fake);
        assert_eq!(
            fake.actions(),
            vec!["add-member Administrators hpc.local\\hpcadmin"]
        );
    }

    #[test]
    fn test_joined_node_does_nothing() {
        let fake = FakeNode::new("cn-01");
        let env = fake.env(Role::ComputeNode);
        let p = domain_pipeline(&env);
        let h = Harness::new();
        h.converge_across_reboots(&p, &env, &fake);

        fake.clear_actions();
        let summary = h.converge(&p, &env, &fake);
        assert_eq!(summary.actions(), 0);
        assert!(fake.actions().is_empty());
        assert_eq!(fake.reboots(), 1);
    }

    #[test]
    fn test_join_failure_is_fatal_after_retries() {
        let fake = FakeNode::new("cn-01");
        fake.fail("join_domain", 100);
        let env = fake.env(Role::ComputeNode);
        let p = domain_pipeline(&env);
        let h = Harness::new();

        let err = h.run(&p, &env, &fake).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(err.to_string().contains("Failed to join the domain after 31 attempts"));
        assert_eq!(h.clock.sleeps().len(), 30);
        assert_eq!(fake.reboots(), 0);
    }

    #[test]
    fn test_transient_join_failure_recovers() {
        let fake = FakeNode::new("cn-01");
        fake.fail("join_domain", 2);
        let env = fake.env(Role::ComputeNode);
        let p = domain_pipeline(&env);

        let first = Harness::new().run(&p, &env, &fake).unwrap();
        assert!(matches!(first, PassOutcome::RebootPending { .. }));
        assert!(fake.world().part_of_domain);
    }

    #[test]
    fn test_domain_controller_promotes_and_adds_forwarders() {
        let fake = FakeNode::new("dc-01");
        let env = fake.env(Role::DomainController);
        let p = domain_pipeline(&env);
        let h = Harness::new();

        h.converge_across_reboots(&p, &env, &fake);
        let world = fake.world();
        assert_eq!(world.domain_role, DomainRole::PrimaryDomainController);
        assert_eq!(world.dns_forwarders, vec!["8.8.8.8"]);
        assert!(world.local_users.contains("hpcadmin"));
        assert!(!fake.did("join-domain"));
    }

    #[test]
    fn test_update_removal_is_best_effort() {
        let fake = FakeNode::new("cn-01");
        fake.with(|w| {
            w.part_of_domain = true;
            w.dns_servers = vec!["10.0.0.4".into(), "8.8.8.8".into()];
            w.updates.insert("KB5005112".into());
            w.updates.insert("KB5005113".into());
        });
        fake.exit_codes("uninstall_update", &[87]);
        let mut env = fake.env(Role::ComputeNode);
        env.config.updates.uninstall = vec!["kb5005112".into(), "5005113".into(), "KB1234567".into()];
        let p = domain_pipeline(&env);
        let h = Harness::new();

        let first = h.run(&p, &env, &fake).unwrap();
        let summary = first.summary().unwrap();
        assert!(matches!(
            summary.report("uninstall-kb5005112"),
            Some(StepReport::Failed { reason, .. }) if reason.contains("87")
        ));
        assert!(matches!(
            summary.report("uninstall-kb5005113"),
            Some(StepReport::Applied { .. })
        ));
        assert_eq!(
            summary.report("uninstall-kb1234567"),
            Some(&StepReport::Skipped {
                reason: SkipReason::PreconditionNotMet
            })
        );
        // The successful removal asked for a reboot at the checkpoint
        assert!(
            matches!(first, PassOutcome::RebootPending { ref step, .. } if step == "domain-reboot")
        );
        assert!(fake.world().updates.contains("KB5005112"));
        assert!(!fake.world().updates.contains("KB5005113"));
    }
}
