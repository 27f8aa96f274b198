//! Cluster communication certificate

use crate::config::NodeConfig;
use crate::node::{NodeStep, transient};
use crate::role::Role;
use convergence::ActionResult;

const PERSONAL_STORE: &str = "My";
const ROOT_STORE: &str = "Root";

pub fn steps(role: Role, config: &NodeConfig) -> Vec<NodeStep> {
    let mut steps = vec![
        NodeStep::new(
            "fetch-certificate",
            "Download the communication certificate",
            |env| {
                env.packages
                    .download(&env.config.cert.filename, &env.config.downloads_dir())
                    .map_err(transient)?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("certificate is cached", |env| {
            Ok(env.probe.file_exists(&env.config.cert_path()))
        })
        .retry(config.retries.download.policy()),
        NodeStep::new(
            "import-certificate",
            "Import the certificate into LocalMachine\\My",
            |env| {
                env.ops.import_certificate(
                    PERSONAL_STORE,
                    &env.config.cert_path(),
                    &env.credentials.cert_password,
                )?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("thumbprint present in LocalMachine\\My", |env| {
            env.probe.certificate_installed(
                PERSONAL_STORE,
                &env.config.cert_path(),
                &env.credentials.cert_password,
            )
        }),
    ];

    // Brokers get the certificate from the installer itself
    if config.cert.import_root && matches!(role, Role::HeadNode | Role::ComputeNode) {
        steps.push(
            NodeStep::new(
                "trust-certificate",
                "Import the certificate into LocalMachine\\Root",
                |env| {
                    env.ops.import_certificate(
                        ROOT_STORE,
                        &env.config.cert_path(),
                        &env.credentials.cert_password,
                    )?;
                    Ok(ActionResult::Done)
                },
            )
            .not_if("thumbprint present in LocalMachine\\Root", |env| {
                env.probe.certificate_installed(
                    ROOT_STORE,
                    &env.config.cert_path(),
                    &env.credentials.cert_password,
                )
            }),
        );
    }

    steps
}
