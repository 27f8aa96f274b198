//! Role pipelines
//!
//! Each role's pipeline is composed from the same sub-pipelines, in order:
//! prerequisites, domain, certificate, role install and (head node only)
//! the autoscaler. Steps a role install wants at the very end of the pass go
//! into the pipeline's deferred phase.

pub mod autoscaler;
pub mod certificate;
pub mod domain;
pub mod prerequisites;
pub mod role_install;

#[cfg(test)]
pub(crate) mod harness;

use crate::config::NodeConfig;
use crate::node::NodeEnv;
use crate::role::Role;
use convergence::{Pipeline, PipelineBuilder};

/// Build the pipeline for `role`.
///
/// The pipeline name is the role name; it is what the state file records.
pub fn for_role(role: Role, config: &NodeConfig) -> convergence::Result<Pipeline<NodeEnv>> {
    let mut builder = PipelineBuilder::new(role.as_str());

    if role.is_cluster_member() {
        builder.steps(prerequisites::steps(config));
    }

    builder.steps(domain::steps(role, config)?);

    if role.is_cluster_member() {
        builder.steps(certificate::steps(role, config));
    }

    let install = role_install::steps(role, config);
    builder.steps(install.main);

    if role == Role::HeadNode {
        builder.steps(autoscaler::steps(config));
    }

    for step in install.deferred {
        builder.defer(step);
    }

    builder.build()
}
