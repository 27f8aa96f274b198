use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Function a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Standalone Active Directory domain controller
    DomainController,
    /// HPC Pack head node (optionally also the domain controller)
    HeadNode,
    /// HPC Pack compute node
    ComputeNode,
    /// HPC Pack SOA broker node
    BrokerNode,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DomainController => "domain-controller",
            Self::HeadNode => "head-node",
            Self::ComputeNode => "compute-node",
            Self::BrokerNode => "broker-node",
        }
    }

    /// Roles that connect to an existing head node
    pub fn needs_head_node(self) -> bool {
        matches!(self, Self::ComputeNode | Self::BrokerNode)
    }

    /// Roles that install HPC Pack
    pub fn is_cluster_member(self) -> bool {
        !matches!(self, Self::DomainController)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
