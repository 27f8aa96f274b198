//! Per-pass environment shared by every step

use crate::config::NodeConfig;
use crate::platform::{ClusterManager, HeadNode, Operations, PackageFetcher, SystemProbe};
use crate::role::Role;
use crate::secrets::Credentials;
use convergence::{ActionResult, Step, StepError};
use std::rc::Rc;

/// Step over the node environment
pub type NodeStep = Step<NodeEnv>;

/// What a step's action and guards can see.
///
/// Built once per pass. The configuration and secrets never change while
/// the pass runs.
pub struct NodeEnv {
    pub config: NodeConfig,
    pub role: Role,
    /// This machine's hostname
    pub hostname: String,
    /// Resolved head node; `None` for roles that don't need one
    pub head_node: Option<HeadNode>,
    pub credentials: Credentials,
    pub probe: Rc<dyn SystemProbe>,
    pub ops: Rc<dyn Operations>,
    pub cluster: Rc<dyn ClusterManager>,
    pub packages: Rc<dyn PackageFetcher>,
}

impl NodeEnv {
    /// Scheduler the HPC cmdlets talk to
    pub fn scheduler(&self) -> &str {
        match &self.head_node {
            Some(hn) => &hn.hostname,
            None => &self.hostname,
        }
    }

    /// Head node hostname, for roles that connect to one
    pub fn head_node_name(&self) -> Result<&str, StepError> {
        self.head_node
            .as_ref()
            .map(|hn| hn.hostname.as_str())
            .ok_or_else(|| StepError::configuration("head node has not been resolved"))
    }

    /// DNS servers the node's adapters should use before joining.
    ///
    /// When the head node is the domain controller its address replaces the
    /// configured servers.
    pub fn dns_servers(&self) -> Vec<String> {
        if self.config.head_node_as_dc
            && self.role.needs_head_node()
            && let Some(ip) = self.head_node.as_ref().and_then(|hn| hn.ip_address.clone())
        {
            return vec![ip];
        }
        self.config.ad.dns_servers.clone()
    }

    /// `DOMAIN\admin`
    pub fn domain_admin(&self) -> String {
        self.credentials.domain_user(&self.config.ad.domain)
    }
}

/// Another installation is in progress (`ERROR_INSTALL_ALREADY_RUNNING`)
const INSTALL_ALREADY_RUNNING: i32 = 1618;
/// Success, restart required (`ERROR_SUCCESS_REBOOT_REQUIRED`)
const SUCCESS_REBOOT_REQUIRED: i32 = 3010;
/// Success, restart initiated (`ERROR_SUCCESS_REBOOT_INITIATED`)
const SUCCESS_REBOOT_INITIATED: i32 = 1641;
/// wusa: the update is not installed on this machine (0x00240006)
const WUSA_NOT_APPLICABLE: i32 = 2_359_302;

/// Map an installer exit code to a step result
pub fn installer_outcome(what: &str, code: i32) -> Result<ActionResult, StepError> {
    match code {
        0 => Ok(ActionResult::Done),
        SUCCESS_REBOOT_REQUIRED | SUCCESS_REBOOT_INITIATED => {
            log::info!("{what} finished and needs a restart (exit code {code})");
            Ok(ActionResult::RebootRequired)
        }
        INSTALL_ALREADY_RUNNING => Err(StepError::transient(format!(
            "{what}: another installation is in progress (exit code {code})"
        ))),
        _ => Err(StepError::permanent(format!(
            "{what} failed with exit code {code}"
        ))),
    }
}

/// Map a `wusa /uninstall` exit code; a restart is handled by the checkpoint
pub fn uninstall_outcome(kb: &str, code: i32) -> Result<ActionResult, StepError> {
    match code {
        0 | SUCCESS_REBOOT_REQUIRED | SUCCESS_REBOOT_INITIATED | WUSA_NOT_APPLICABLE => {
            Ok(ActionResult::Done)
        }
        INSTALL_ALREADY_RUNNING => Err(StepError::transient(format!(
            "uninstalling {kb}: another installation is in progress"
        ))),
        _ => Err(StepError::permanent(format!(
            "uninstalling {kb} failed with exit code {code}"
        ))),
    }
}

/// Treat a collaborator failure as retryable
pub fn transient(err: anyhow::Error) -> StepError {
    StepError::transient(format!("{err:#}"))
}
