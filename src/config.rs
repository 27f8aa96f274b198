//! Node configuration
//!
//! Everything a pass needs to know about the node and its cluster is read
//! once from a TOML file into an immutable [`NodeConfig`]. A missing file
//! yields the defaults below, which mirror a stock HPC Pack deployment.

use crate::paths;
use crate::role::Role;
use anyhow::{Context, Result};
use convergence::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Main Config Schema
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Role of this node; `--role` overrides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// HPC Pack release
    #[serde(default)]
    pub version: HpcVersion,

    /// Head node also acts as the domain controller
    #[serde(default)]
    pub head_node_as_dc: bool,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub ad: AdConfig,

    #[serde(default)]
    pub keyvault: KeyVaultConfig,

    #[serde(default)]
    pub cert: CertConfig,

    #[serde(default)]
    pub head_node: HeadNodeConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub node: NodeIdentity,

    #[serde(default)]
    pub packages: PackagesConfig,

    #[serde(default)]
    pub updates: UpdatesConfig,

    #[serde(default)]
    pub autoscale: AutoscaleConfig,

    #[serde(default)]
    pub retries: RetriesConfig,

    #[serde(default)]
    pub reentry: ReentryConfig,
}

impl NodeConfig {
    /// Load the config file, or return defaults if it doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML format in {}", path.display()))
    }

    /// Role from the command line, falling back to the config file
    pub fn resolve_role(&self, flag: Option<Role>) -> Result<Role> {
        flag.or(self.role)
            .context("No role given; pass --role or set `role` in the config file")
    }

    /// Validate the configuration for a role
    pub fn validate(&self, role: Role) -> Result<()> {
        if self.ad.domain.trim().is_empty() {
            anyhow::bail!("ad.domain cannot be empty");
        }
        if self.cert.filename.trim().is_empty() {
            anyhow::bail!("cert.filename cannot be empty");
        }

        if role.needs_head_node() {
            let explicit = self.head_node.hostname.is_some();
            let discoverable =
                self.head_node.cluster_uid.is_some() && self.head_node.discovery_command.is_some();
            if !explicit && !discoverable {
                anyhow::bail!(
                    "{role} needs a head node: set head_node.hostname, or head_node.cluster_uid together with head_node.discovery_command"
                );
            }
        }

        if self.keyvault.vault_name.is_none() {
            if self.ad.admin_name.is_none() || self.ad.admin_password.is_none() {
                anyhow::bail!(
                    "Admin credentials missing: set keyvault.vault_name, or ad.admin_name and ad.admin_password"
                );
            }
        } else {
            self.keyvault
                .validate()
                .context("Invalid [keyvault] section")?;
        }

        for kb in &self.updates.uninstall {
            crate::pipeline::domain::normalize_kb(kb)
                .with_context(|| format!("Invalid entry in updates.uninstall: '{kb}'"))?;
        }

        Ok(())
    }

    /// Directory where bootstrap artifacts live
    pub fn bootstrap_dir(&self) -> PathBuf {
        paths::expand(&self.paths.bootstrap_dir)
    }

    /// Directory where downloaded packages are cached
    pub fn downloads_dir(&self) -> PathBuf {
        paths::expand(&self.paths.downloads_dir)
    }

    /// HPC Pack installation media directory
    pub fn install_dir(&self) -> PathBuf {
        match &self.paths.install_dir {
            Some(dir) => paths::expand(dir),
            None => PathBuf::from(format!("C:\\HPCPack{}", self.version.as_str())),
        }
    }

    /// Where compute and broker installer media is unpacked or copied
    pub fn media_dir(&self) -> PathBuf {
        self.bootstrap_dir().join("hpcpack")
    }

    /// Full path of the communication certificate once downloaded
    pub fn cert_path(&self) -> PathBuf {
        self.downloads_dir().join(&self.cert.filename)
    }
}

/// Supported HPC Pack releases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HpcVersion {
    #[serde(rename = "2016")]
    V2016,
    #[default]
    #[serde(rename = "2019")]
    V2019,
}

impl HpcVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V2016 => "2016",
            Self::V2019 => "2019",
        }
    }

    /// Minimum .NET Framework release key the installer accepts
    pub fn min_netfx_release(self) -> u32 {
        match self {
            Self::V2016 => 393_295,
            Self::V2019 => 461_808,
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_bootstrap_dir")]
    pub bootstrap_dir: String,

    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: String,

    /// Defaults to `C:\HPCPack<version>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bootstrap_dir: default_bootstrap_dir(),
            downloads_dir: default_downloads_dir(),
            install_dir: None,
        }
    }
}

fn default_bootstrap_dir() -> String {
    "C:\\cycle\\jetpack\\system\\bootstrap".to_string()
}

fn default_downloads_dir() -> String {
    "C:\\cycle\\jetpack\\downloads".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdConfig {
    #[serde(default = "default_domain")]
    pub domain: String,

    /// DNS servers the node's adapters point at before joining
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,

    /// Forwarders configured on a newly promoted domain controller
    #[serde(default = "default_dns_forwarders")]
    pub dns_forwarders: Vec<String>,

    /// Used when no key vault is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_name: Option<String>,

    /// Used when no key vault is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
}

impl Default for AdConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            dns_servers: default_dns_servers(),
            dns_forwarders: default_dns_forwarders(),
            admin_name: None,
            admin_password: None,
        }
    }
}

fn default_domain() -> String {
    "hpc.local".to_string()
}

fn default_dns_servers() -> Vec<String> {
    vec!["10.0.0.4".to_string(), "8.8.8.8".to_string()]
}

fn default_dns_forwarders() -> Vec<String> {
    vec!["8.8.8.8".to_string()]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyVaultConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_name_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_password_key: Option<String>,

    /// Vault certificate used by the broker installer instead of the PFX file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_name: Option<String>,
}

impl KeyVaultConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vault_name.as_deref().is_some_and(|v| v.trim().is_empty()) {
            anyhow::bail!("vault_name cannot be empty");
        }
        if self.admin_name_key.is_none() || self.admin_password_key.is_none() {
            anyhow::bail!("admin_name_key and admin_password_key are required with a vault");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertConfig {
    #[serde(default = "default_cert_filename")]
    pub filename: String,

    /// Used when no key vault key is configured for the passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Also trust the certificate in `LocalMachine\Root`
    #[serde(default = "default_true")]
    pub import_root: bool,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            filename: default_cert_filename(),
            password: None,
            import_root: true,
        }
    }
}

fn default_cert_filename() -> String {
    "hpc-comm.pfx".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadNodeConfig {
    /// Explicit head node hostname; skips discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Cluster the head node belongs to, for discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_uid: Option<String>,

    #[serde(default = "default_hn_role_tag")]
    pub role_tag: String,

    #[serde(default = "default_hn_recipe_tag")]
    pub recipe_tag: String,

    /// Command printing `{"hostname", "ip_address", "fqdn"}` for a cluster
    /// uid, role tag and recipe tag given as arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_command: Option<String>,
}

impl Default for HeadNodeConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            ip_address: None,
            cluster_uid: None,
            role_tag: default_hn_role_tag(),
            recipe_tag: default_hn_recipe_tag(),
            discovery_command: None,
        }
    }
}

fn default_hn_role_tag() -> String {
    "hn".to_string()
}

fn default_hn_recipe_tag() -> String {
    "hpcpack::hn".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u32,

    #[serde(default = "default_inactivity_count")]
    pub inactivity_count: u32,

    #[serde(default = "default_min_node_count")]
    pub min_node_count: u32,

    #[serde(default = "default_compute_template")]
    pub compute_template: String,

    #[serde(default = "default_broker_template")]
    pub broker_template: String,

    /// Seconds a new node stays Offline before it is brought Online
    #[serde(default = "default_offline_settle_secs")]
    pub offline_settle_secs: u64,

    #[serde(default)]
    pub job: JobThresholds,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            inactivity_count: default_inactivity_count(),
            min_node_count: default_min_node_count(),
            compute_template: default_compute_template(),
            broker_template: default_broker_template(),
            offline_settle_secs: default_offline_settle_secs(),
            job: JobThresholds::default(),
        }
    }
}

/// Job-runtime thresholds handed to the autoscaler, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobThresholds {
    /// Runtime assumed for a job that does not declare one
    #[serde(default = "default_one_hour")]
    pub default_runtime: u64,

    /// Queued work beyond this much runtime triggers adding nodes
    #[serde(default = "default_one_hour")]
    pub add_node_threshold: u64,
}

impl Default for JobThresholds {
    fn default() -> Self {
        Self {
            default_runtime: default_one_hour(),
            add_node_threshold: default_one_hour(),
        }
    }
}

fn default_one_hour() -> u64 {
    3600
}

fn default_heartbeat_interval() -> u32 {
    30
}

fn default_inactivity_count() -> u32 {
    10
}

fn default_min_node_count() -> u32 {
    1
}

fn default_offline_settle_secs() -> u64 {
    10
}

fn default_compute_template() -> String {
    "Default ComputeNode Template".to_string()
}

fn default_broker_template() -> String {
    "Default BrokerNode Template".to_string()
}

/// Identity of this node in the provisioning system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Node array / group; becomes the node's data center location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagesConfig {
    /// Base URL or directory packages are fetched from
    #[serde(default)]
    pub source: String,

    #[serde(default = "default_netfx_installer")]
    pub netfx_installer: String,

    #[serde(default = "default_compute_installer")]
    pub compute_installer: String,

    #[serde(default = "default_head_node_script")]
    pub head_node_script: String,

    #[serde(default = "default_broker_node_script")]
    pub broker_node_script: String,

    /// Expected blake3 digests by package name
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            netfx_installer: default_netfx_installer(),
            compute_installer: default_compute_installer(),
            head_node_script: default_head_node_script(),
            broker_node_script: default_broker_node_script(),
            checksums: BTreeMap::new(),
        }
    }
}

fn default_netfx_installer() -> String {
    "ndp48-x86-x64-allos-enu.exe".to_string()
}

fn default_compute_installer() -> String {
    "HpcComputeNodeInstaller.zip".to_string()
}

fn default_head_node_script() -> String {
    "InstallHPCHeadNode.ps1".to_string()
}

fn default_broker_node_script() -> String {
    "InstallHPCBrokerNode.ps1".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatesConfig {
    /// OS updates (KB numbers) removed before installing HPC Pack
    #[serde(default)]
    pub uninstall: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscaleConfig {
    #[serde(default = "default_true")]
    pub start_enabled: bool,

    #[serde(default = "default_true")]
    pub deallocate: bool,

    #[serde(default = "default_idle_time_after_jobs")]
    pub idle_time_after_jobs: u64,

    #[serde(default = "default_provisioning_timeout")]
    pub provisioning_timeout: u64,

    #[serde(default = "default_max_deallocated_nodes")]
    pub max_deallocated_nodes: u32,

    #[serde(default = "default_autoscale_task")]
    pub task_name: String,

    /// Command the autoscale task runs; defaults to the bundled launcher
    /// pointed at `autoscale.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default = "default_autoscale_packages")]
    pub packages: Vec<String>,

    #[serde(default)]
    pub cyclecloud: CycleCloudConfig,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            start_enabled: true,
            deallocate: true,
            idle_time_after_jobs: default_idle_time_after_jobs(),
            provisioning_timeout: default_provisioning_timeout(),
            max_deallocated_nodes: default_max_deallocated_nodes(),
            task_name: default_autoscale_task(),
            command: None,
            packages: default_autoscale_packages(),
            cyclecloud: CycleCloudConfig::default(),
        }
    }
}

impl AutoscaleConfig {
    /// The zip archive holding the autoscaler itself
    pub fn archive(&self) -> Option<&str> {
        self.packages
            .iter()
            .map(String::as_str)
            .find(|p| p.ends_with(".zip"))
    }
}

fn default_idle_time_after_jobs() -> u64 {
    300
}

fn default_provisioning_timeout() -> u64 {
    1500
}

fn default_max_deallocated_nodes() -> u32 {
    300
}

fn default_autoscale_task() -> String {
    "HPCAutoscale".to_string()
}

fn default_autoscale_packages() -> Vec<String> {
    vec![
        "cyclecloud_api-8.0.1-py2.py3-none-any.whl".to_string(),
        "cyclecloud-scalelib-0.1.1.tar.gz".to_string(),
        "hpcpack-autoscaler.zip".to_string(),
    ]
}

/// Connection to the orchestrator the autoscaler talks to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleCloudConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default)]
    pub verify_certificates: bool,
}

/// Retry count and delay for one kind of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Additional attempts after the first one
    pub retries: u32,
    pub delay_secs: u64,
}

impl RetrySettings {
    const fn new(retries: u32, delay_secs: u64) -> Self {
        Self {
            retries,
            delay_secs,
        }
    }

    pub fn policy(self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.retries.saturating_add(1),
            Duration::from_secs(self.delay_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetriesConfig {
    pub domain_join: RetrySettings,
    pub download: RetrySettings,
    pub head_node_share: RetrySettings,
    pub template_lookup: RetrySettings,
    pub node_registration: RetrySettings,
    pub cluster_command: RetrySettings,
    pub offline_wait: RetrySettings,
}

impl Default for RetriesConfig {
    fn default() -> Self {
        Self {
            domain_join: RetrySettings::new(30, 10),
            download: RetrySettings::new(3, 10),
            head_node_share: RetrySettings::new(50, 20),
            template_lookup: RetrySettings::new(60, 10),
            node_registration: RetrySettings::new(5, 10),
            cluster_command: RetrySettings::new(3, 5),
            offline_wait: RetrySettings::new(10, 10),
        }
    }
}

/// Boot-time task that re-runs the agent after a reboot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReentryConfig {
    #[serde(default = "default_reentry_task")]
    pub task_name: String,

    /// Command the task runs; defaults to this executable with `converge`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Hours after which a leftover lock file is ignored
    #[serde(default = "default_stale_lock_hours")]
    pub stale_lock_hours: u64,
}

impl Default for ReentryConfig {
    fn default() -> Self {
        Self {
            task_name: default_reentry_task(),
            command: None,
            stale_lock_hours: default_stale_lock_hours(),
        }
    }
}

fn default_reentry_task() -> String {
    "hpcnode_onboot".to_string()
}

fn default_stale_lock_hours() -> u64 {
    6
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.ad.admin_name = Some("hpcadmin".into());
        config.ad.admin_password = Some("s3cret!".into());
        config.head_node.hostname = Some("hn-01".into());
        config
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.ad.dns_servers, vec!["10.0.0.4", "8.8.8.8"]);
        assert_eq!(config.cluster.heartbeat_interval, 30);
        assert_eq!(config.cluster.inactivity_count, 10);
        assert_eq!(config.cluster.min_node_count, 1);
        assert_eq!(config.cluster.job.default_runtime, 3600);
        assert_eq!(config.cert.filename, "hpc-comm.pfx");
        assert_eq!(config.version, HpcVersion::V2019);
        assert_eq!(config.install_dir(), PathBuf::from("C:\\HPCPack2019"));
        assert_eq!(config.autoscale.archive(), Some("hpcpack-autoscaler.zip"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_parse_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
role = "compute-node"
version = "2016"

[ad]
domain = "contoso.hpc"

[head_node]
hostname = "hn-01"

[retries]
offline_wait = { retries = 2, delay_secs = 1 }

[updates]
uninstall = ["KB5005112"]
"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.role, Some(Role::ComputeNode));
        assert_eq!(config.version.min_netfx_release(), 393_295);
        assert_eq!(config.ad.domain, "contoso.hpc");
        assert_eq!(config.ad.dns_forwarders, vec!["8.8.8.8"]);
        assert_eq!(config.retries.offline_wait.policy().max_attempts, 3);
        assert_eq!(config.retries.head_node_share.retries, 50);
    }

    #[test]
    fn test_resolve_role_prefers_flag() {
        let mut config = NodeConfig::default();
        assert!(config.resolve_role(None).is_err());
        config.role = Some(Role::HeadNode);
        assert_eq!(config.resolve_role(None).unwrap(), Role::HeadNode);
        assert_eq!(
            config.resolve_role(Some(Role::BrokerNode)).unwrap(),
            Role::BrokerNode
        );
    }

    #[test]
    fn test_validate_requires_head_node_for_compute() {
        let mut config = valid();
        config.head_node.hostname = None;
        assert!(config.validate(Role::HeadNode).is_ok());
        assert!(config.validate(Role::ComputeNode).is_err());

        config.head_node.cluster_uid = Some("c-42".into());
        config.head_node.discovery_command = Some("find-hn.cmd".into());
        assert!(config.validate(Role::ComputeNode).is_ok());
    }

    #[test]
    fn test_validate_requires_credentials_source() {
        let mut config = valid();
        config.ad.admin_password = None;
        assert!(config.validate(Role::HeadNode).is_err());

        config.keyvault.vault_name = Some("hpc-vault".into());
        config.keyvault.admin_name_key = Some("admin-name".into());
        config.keyvault.admin_password_key = Some("admin-password".into());
        assert!(config.validate(Role::HeadNode).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_kb() {
        let mut config = valid();
        config.updates.uninstall = vec!["not-a-kb".into()];
        assert!(config.validate(Role::HeadNode).is_err());
    }

    #[test]
    fn test_retry_settings_policy_counts_first_attempt() {
        let policy = RetrySettings::new(10, 10).policy();
        assert_eq!(policy.max_attempts, 11);
        assert_eq!(policy.delay, Duration::from_secs(10));
    }

    #[test]
    fn test_huge_retry_count_saturates() {
        let policy = RetrySettings::new(u32::MAX, 1).policy();
        assert_eq!(policy.max_attempts, u32::MAX);
    }
}
