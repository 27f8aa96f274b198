//! Collaborator interfaces
//!
//! Everything that touches the operating system, the directory service, the
//! HPC scheduler or the network goes through one of these traits, so the
//! pipelines can be exercised against an in-memory node in tests.

pub mod keyvault;
pub mod locator;
pub mod packages;
pub mod powershell;

#[cfg(test)]
pub mod fake;

use crate::secrets::Secret;
use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub use keyvault::KeyVault;
pub use locator::CommandLocator;
pub use packages::PackageCache;
pub use powershell::{PowerShellNode, WindowsReboot};

// ============================================================================
// System state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Missing,
    Stopped,
    Running,
}

impl ServiceStatus {
    pub fn exists(self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// `Win32_ComputerSystem.DomainRole`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRole {
    StandaloneWorkstation,
    MemberWorkstation,
    StandaloneServer,
    MemberServer,
    BackupDomainController,
    PrimaryDomainController,
}

impl DomainRole {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::StandaloneWorkstation,
            1 => Self::MemberWorkstation,
            2 => Self::StandaloneServer,
            3 => Self::MemberServer,
            4 => Self::BackupDomainController,
            5 => Self::PrimaryDomainController,
            _ => return None,
        })
    }

    pub fn is_domain_controller(self) -> bool {
        matches!(
            self,
            Self::BackupDomainController | Self::PrimaryDomainController
        )
    }
}

/// Read-only probes used by guards
pub trait SystemProbe {
    fn hostname(&self) -> Result<String>;

    fn service_status(&self, name: &str) -> Result<ServiceStatus>;

    /// `None` if the key or value does not exist
    fn registry_dword(&self, key: &str, value: &str) -> Result<Option<u32>>;

    fn part_of_domain(&self) -> Result<bool>;

    fn domain_role(&self) -> Result<DomainRole>;

    /// Whether an OS update (e.g. `KB5005112`) is installed
    fn update_installed(&self, kb: &str) -> Result<bool>;

    /// Whether the certificate in a PFX file is present in `LocalMachine\<store>`
    fn certificate_installed(&self, store: &str, pfx: &Path, password: &Secret) -> Result<bool>;

    /// The task's current registration, `None` if it doesn't exist
    fn scheduled_task(&self, name: &str) -> Result<Option<RegisteredTask>>;

    fn wsman_available(&self) -> Result<bool>;

    fn nuget_provider_installed(&self) -> Result<bool>;

    fn dns_client_servers(&self) -> Result<Vec<String>>;

    fn dns_forwarders(&self) -> Result<Vec<String>>;

    fn group_members(&self, group: &str) -> Result<Vec<String>>;

    fn machine_env(&self, name: &str) -> Result<Option<String>>;

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// Head node setup parameters
#[derive(Debug, Clone)]
pub struct HeadNodeInstall {
    /// `InstallHPCHeadNode.ps1`
    pub script: PathBuf,
    pub setup_file: PathBuf,
    pub cluster_name: String,
    pub pfx: PathBuf,
    pub pfx_password: Secret,
    pub domain_user: String,
    pub domain_password: Secret,
}

/// Compute node setup parameters
#[derive(Debug, Clone)]
pub struct ComputeNodeInstall {
    pub script: PathBuf,
    pub connection_string: String,
    pub pfx: PathBuf,
    pub pfx_password: Secret,
}

/// Where the broker installer gets its communication certificate
#[derive(Debug, Clone)]
pub enum BrokerCertificate {
    Vault { vault: String, cert_name: String },
    Pfx { path: PathBuf, password: Secret },
}

/// Broker node setup parameters
#[derive(Debug, Clone)]
pub struct BrokerNodeInstall {
    /// `InstallHPCBrokerNode.ps1`
    pub script: PathBuf,
    pub setup_file: PathBuf,
    pub head_node: String,
    pub certificate: BrokerCertificate,
}

/// A periodic scheduled task
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub name: String,
    pub command: String,
    pub every_minutes: u32,
    /// Account the task runs as; `None` for SYSTEM
    pub run_as: Option<(String, Secret)>,
}

/// A scheduled task as the OS reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTask {
    /// Program and arguments of the task's action
    pub command: String,
    /// Principal the task runs as
    pub user: String,
}

impl RegisteredTask {
    /// Whether registering `task` would leave this registration unchanged.
    ///
    /// Passwords cannot be read back and are not compared.
    pub fn matches(&self, task: &ScheduledTask) -> bool {
        let expected_user = task.run_as.as_ref().map_or("SYSTEM", |(user, _)| user.as_str());
        normalize_command(&self.command) == normalize_command(&task.command)
            && account_name(&self.user) == account_name(expected_user)
    }
}

/// The OS may store the program and its arguments with different quoting
fn normalize_command(command: &str) -> String {
    command
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `DOMAIN\user` and `user` name the same account
fn account_name(user: &str) -> String {
    user.rsplit('\\').next().unwrap_or(user).to_ascii_lowercase()
}

/// State-changing operations used by step actions.
///
/// Installers return their raw exit code; interpreting it is up to the
/// caller.
pub trait Operations {
    /// Create or update a local user and set its password
    fn set_local_user_password(&self, user: &str, password: &Secret) -> Result<()>;

    fn add_group_member(&self, group: &str, member: &str) -> Result<()>;

    fn set_dns_client_servers(&self, servers: &[String]) -> Result<()>;

    fn join_domain(&self, domain: &str, user: &str, password: &Secret) -> Result<()>;

    fn promote_domain_controller(&self, domain: &str, safe_mode_password: &Secret) -> Result<()>;

    fn add_dns_forwarder(&self, address: &str) -> Result<()>;

    fn uninstall_update(&self, kb: &str) -> Result<i32>;

    fn import_certificate(&self, store: &str, pfx: &Path, password: &Secret) -> Result<()>;

    fn set_registry_dword(&self, key: &str, value: &str, data: u32) -> Result<()>;

    fn install_nuget_provider(&self) -> Result<()>;

    fn enable_winrm(&self) -> Result<()>;

    fn install_netfx(&self, installer: &Path) -> Result<i32>;

    fn install_head_node(&self, install: &HeadNodeInstall) -> Result<i32>;

    fn install_compute_node(&self, install: &ComputeNodeInstall) -> Result<i32>;

    fn install_broker_node(&self, install: &BrokerNodeInstall) -> Result<i32>;

    /// Register a task, replacing any task with the same name
    fn register_task(&self, task: &ScheduledTask) -> Result<()>;

    fn set_machine_env(&self, name: &str, value: &str) -> Result<()>;

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}

// ============================================================================
// HPC scheduler
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeHealth {
    Ok,
    Warning,
    Error,
    Unapproved,
    Transitional,
    Other(String),
}

impl NodeHealth {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "OK" | "Ok" => Self::Ok,
            "Warning" => Self::Warning,
            "Error" => Self::Error,
            "Unapproved" => Self::Unapproved,
            "Transitional" => Self::Transitional,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Online,
    Offline,
    Draining,
    Provisioning,
    Other(String),
}

impl NodeState {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "Online" => Self::Online,
            "Offline" => Self::Offline,
            "Draining" => Self::Draining,
            "Provisioning" => Self::Provisioning,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A node as the scheduler sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub name: String,
    pub health: NodeHealth,
    pub state: NodeState,
    /// Empty when no location has been set
    pub location: String,
}

pub trait ClusterManager {
    fn node(&self, name: &str) -> Result<Option<ClusterNode>>;

    fn template_exists(&self, template: &str) -> Result<bool>;

    fn assign_template(&self, node: &str, template: &str) -> Result<()>;

    fn set_node_state(&self, node: &str, online: bool) -> Result<()>;

    fn set_node_location(&self, node: &str, data_center: &str, rack: &str) -> Result<()>;

    fn cluster_property(&self, name: &str) -> Result<Option<String>>;

    fn set_cluster_property(&self, name: &str, value: &str) -> Result<()>;
}

// ============================================================================
// Packages, secrets, discovery
// ============================================================================

pub trait PackageFetcher {
    /// Fetch a named package into `dest_dir`, reusing a cached copy
    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Extract a `.zip` or `.tar.gz` archive
    fn unpack(&self, archive: &Path, dest_dir: &Path) -> Result<()>;

    /// Copy the named entries of `source` into `dest`; returns files copied
    fn copy_tree(&self, source: &Path, dest: &Path, entries: &[&str]) -> Result<usize>;
}

pub trait SecretStore {
    fn get_secret(&self, vault: &str, key: &str) -> Result<String>;
}

/// Address of the cluster head node
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeadNode {
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub fqdn: Option<String>,
}

pub trait HeadNodeLocator {
    fn locate(&self, config: &crate::config::HeadNodeConfig) -> Result<HeadNode>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_role_codes() {
        assert_eq!(
            DomainRole::from_code(5),
            Some(DomainRole::PrimaryDomainController)
        );
        assert!(DomainRole::from_code(4).unwrap().is_domain_controller());
        assert!(!DomainRole::from_code(3).unwrap().is_domain_controller());
        assert_eq!(DomainRole::from_code(9), None);
    }

    fn task(command: &str, user: Option<&str>) -> ScheduledTask {
        ScheduledTask {
            name: "HPCAutoscale".into(),
            command: command.into(),
            every_minutes: 1,
            run_as: user.map(|u| (u.to_string(), Secret::new("pw"))),
        }
    }

    #[test]
    fn test_registered_task_matches_modulo_quoting() {
        let registered = RegisteredTask {
            command: r#"powershell.exe -File "C:\cycle\start.ps1"  -ConfigFile C:\cycle\a.json"#.into(),
            user: "HPC\\hpcadmin".into(),
        };
        let same = task(
            r#"powershell.exe -File "C:\cycle\start.ps1" -ConfigFile "C:\cycle\a.json""#,
            Some("hpc.local\\HPCAdmin"),
        );
        assert!(registered.matches(&same));

        let moved = task(
            r#"powershell.exe -File "D:\cycle\start.ps1" -ConfigFile "C:\cycle\a.json""#,
            Some("hpc.local\\hpcadmin"),
        );
        assert!(!registered.matches(&moved));

        let as_system = task(&registered.command, None);
        assert!(!registered.matches(&as_system));
    }

    #[test]
    fn test_parse_scheduler_states() {
        assert_eq!(NodeHealth::parse("Unapproved"), NodeHealth::Unapproved);
        assert_eq!(NodeHealth::parse("OK"), NodeHealth::Ok);
        assert_eq!(NodeState::parse(" Offline\r\n"), NodeState::Offline);
        assert_eq!(
            NodeState::parse("Rebooting"),
            NodeState::Other("Rebooting".into())
        );
    }
}
