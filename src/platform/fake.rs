//! In-memory node used by pipeline and command tests
//!
//! Operations mutate a small model of the machine so guards observe their
//! effects, the way they would on a real node.

use super::{
    BrokerNodeInstall, ClusterManager, ClusterNode, ComputeNodeInstall, DomainRole, HeadNode,
    HeadNodeInstall, NodeHealth, NodeState, Operations, PackageFetcher, RegisteredTask,
    ScheduledTask, SecretStore, ServiceStatus, SystemProbe,
};
use crate::config::NodeConfig;
use crate::node::NodeEnv;
use crate::pipeline::prerequisites::NETFX_KEY;
use crate::role::Role;
use crate::secrets::{Credentials, Secret};
use anyhow::{Result, bail};
use convergence::RebootPlatform;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub const HEAD_NODE: &str = "hn-01";
pub const HEAD_NODE_IP: &str = "10.0.0.5";

/// Observable machine state
#[derive(Debug, Clone)]
pub struct World {
    pub hostname: String,
    pub services: BTreeMap<String, ServiceStatus>,
    pub registry: BTreeMap<(String, String), u32>,
    pub part_of_domain: bool,
    pub domain_role: DomainRole,
    pub updates: BTreeSet<String>,
    pub cert_stores: BTreeSet<String>,
    pub tasks: BTreeMap<String, ScheduledTask>,
    pub wsman: bool,
    pub nuget: bool,
    pub dns_servers: Vec<String>,
    pub dns_forwarders: Vec<String>,
    pub local_users: BTreeSet<String>,
    pub groups: BTreeMap<String, Vec<String>>,
    pub machine_env: BTreeMap<String, String>,
    pub files: BTreeMap<PathBuf, Vec<u8>>,
    /// Files each archive (by file name) unpacks to
    pub archives: BTreeMap<String, Vec<String>>,
    /// Whether the head node's install share is reachable
    pub share_available: bool,
    pub cluster_nodes: BTreeMap<String, ClusterNode>,
    pub templates: BTreeSet<String>,
    pub cluster_properties: BTreeMap<String, String>,
    /// Whether installing a compute/broker node registers it with the scheduler
    pub register_on_install: bool,
    /// State a freshly registered node reports
    pub registered_state: NodeState,
    /// Exit codes returned by installers, by operation name; 0 when empty
    pub exit_codes: BTreeMap<String, VecDeque<i32>>,
    /// Remaining injected failures by operation name
    pub failures: BTreeMap<String, u32>,
    pub secrets: BTreeMap<String, String>,
}

impl World {
    fn new(hostname: &str) -> Self {
        let mut archives = BTreeMap::new();
        archives.insert(
            "HpcComputeNodeInstaller.zip".to_string(),
            vec!["InstallHPCComputeNode.ps1".to_string()],
        );
        archives.insert(
            "hpcpack-autoscaler.zip".to_string(),
            vec!["hpcpack-autoscaler/bin/start-autoscaler.ps1".to_string()],
        );

        let mut templates = BTreeSet::new();
        templates.insert("Default ComputeNode Template".to_string());
        templates.insert("Default BrokerNode Template".to_string());

        let mut groups = BTreeMap::new();
        groups.insert("Administrators".to_string(), vec!["Administrator".to_string()]);

        Self {
            hostname: hostname.to_string(),
            services: BTreeMap::new(),
            registry: BTreeMap::new(),
            part_of_domain: false,
            domain_role: DomainRole::StandaloneServer,
            updates: BTreeSet::new(),
            cert_stores: BTreeSet::new(),
            tasks: BTreeMap::new(),
            wsman: false,
            nuget: false,
            dns_servers: vec!["168.63.129.16".to_string()],
            dns_forwarders: Vec::new(),
            local_users: BTreeSet::new(),
            groups,
            machine_env: BTreeMap::new(),
            files: BTreeMap::new(),
            archives,
            share_available: true,
            cluster_nodes: BTreeMap::new(),
            templates,
            cluster_properties: BTreeMap::new(),
            register_on_install: true,
            registered_state: NodeState::Offline,
            exit_codes: BTreeMap::new(),
            failures: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    fn register(&mut self) {
        if !self.register_on_install {
            return;
        }
        let name = self.hostname.clone();
        self.cluster_nodes.insert(
            name.clone(),
            ClusterNode {
                name,
                health: NodeHealth::Unapproved,
                state: self.registered_state.clone(),
                location: String::new(),
            },
        );
    }
}

pub struct FakeNode {
    world: RefCell<World>,
    actions: RefCell<Vec<String>>,
    reentry_calls: Cell<u32>,
    reboots: Cell<u32>,
}

impl FakeNode {
    pub fn new(hostname: &str) -> Rc<Self> {
        Rc::new(Self {
            world: RefCell::new(World::new(hostname)),
            actions: RefCell::new(Vec::new()),
            reentry_calls: Cell::new(0),
            reboots: Cell::new(0),
        })
    }

    /// Environment for `role` backed by this node
    pub fn env(self: &Rc<Self>, role: Role) -> NodeEnv {
        let mut config = NodeConfig::default();
        config.role = Some(role);
        config.packages.source = "https://packages.example".to_string();
        config.ad.admin_name = Some("hpcadmin".to_string());
        config.ad.admin_password = Some("P@ssw0rd".to_string());

        let head_node = role.needs_head_node().then(|| {
            config.head_node.hostname = Some(HEAD_NODE.to_string());
            HeadNode {
                hostname: HEAD_NODE.to_string(),
                ip_address: Some(HEAD_NODE_IP.to_string()),
                fqdn: None,
            }
        });

        NodeEnv {
            config,
            role,
            hostname: self.world.borrow().hostname.clone(),
            head_node,
            credentials: Credentials {
                admin_name: Secret::new("hpcadmin"),
                admin_password: Secret::new("P@ssw0rd"),
                cert_password: Secret::new("pfx-pass"),
            },
            probe: self.clone(),
            ops: self.clone(),
            cluster: self.clone(),
            packages: self.clone(),
        }
    }

    /// Modify the machine model
    pub fn with(&self, f: impl FnOnce(&mut World)) {
        f(&mut self.world.borrow_mut());
    }

    /// Snapshot of the machine model
    pub fn world(&self) -> World {
        self.world.borrow().clone()
    }

    /// Fail the next `count` calls of `op`
    pub fn fail(&self, op: &str, count: u32) {
        self.world
            .borrow_mut()
            .failures
            .insert(op.to_string(), count);
    }

    /// Make the next runs of installer `op` exit with `codes`
    pub fn exit_codes(&self, op: &str, codes: &[i32]) {
        self.world
            .borrow_mut()
            .exit_codes
            .insert(op.to_string(), codes.iter().copied().collect());
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.borrow().clone()
    }

    pub fn clear_actions(&self) {
        self.actions.borrow_mut().clear();
    }

    /// Whether an action starting with `prefix` was performed
    pub fn did(&self, prefix: &str) -> bool {
        self.actions.borrow().iter().any(|a| a.starts_with(prefix))
    }

    pub fn reentry_calls(&self) -> u32 {
        self.reentry_calls.get()
    }

    pub fn reboots(&self) -> u32 {
        self.reboots.get()
    }

    fn act(&self, action: impl Into<String>) {
        self.actions.borrow_mut().push(action.into());
    }

    fn check(&self, op: &str) -> Result<()> {
        let mut world = self.world.borrow_mut();
        if let Some(remaining) = world.failures.get_mut(op)
            && *remaining > 0
        {
            *remaining -= 1;
            bail!("{op} failed (injected)");
        }
        Ok(())
    }

    fn exit_code(&self, op: &str) -> i32 {
        self.world
            .borrow_mut()
            .exit_codes
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .unwrap_or(0)
    }
}

impl SystemProbe for FakeNode {
    fn hostname(&self) -> Result<String> {
        Ok(self.world.borrow().hostname.clone())
    }

    fn service_status(&self, name: &str) -> Result<ServiceStatus> {
        self.check("service_status")?;
        Ok(self
            .world
            .borrow()
            .services
            .get(name)
            .copied()
            .unwrap_or(ServiceStatus::Missing))
    }

    fn registry_dword(&self, key: &str, value: &str) -> Result<Option<u32>> {
        self.check("registry_dword")?;
        Ok(self
            .world
            .borrow()
            .registry
            .get(&(key.to_string(), value.to_string()))
            .copied())
    }

    fn part_of_domain(&self) -> Result<bool> {
        self.check("part_of_domain")?;
        Ok(self.world.borrow().part_of_domain)
    }

    fn domain_role(&self) -> Result<DomainRole> {
        self.check("domain_role")?;
        Ok(self.world.borrow().domain_role)
    }

    fn update_installed(&self, kb: &str) -> Result<bool> {
        self.check("update_installed")?;
        Ok(self.world.borrow().updates.contains(kb))
    }

    fn certificate_installed(&self, store: &str, _pfx: &Path, _password: &Secret) -> Result<bool> {
        self.check("certificate_installed")?;
        Ok(self.world.borrow().cert_stores.contains(store))
    }

    fn scheduled_task(&self, name: &str) -> Result<Option<RegisteredTask>> {
        Ok(self.world.borrow().tasks.get(name).map(|task| RegisteredTask {
            command: task.command.clone(),
            user: task
                .run_as
                .as_ref()
                .map_or_else(|| "SYSTEM".to_string(), |(user, _)| user.clone()),
        }))
    }

    fn wsman_available(&self) -> Result<bool> {
        Ok(self.world.borrow().wsman)
    }

    fn nuget_provider_installed(&self) -> Result<bool> {
        Ok(self.world.borrow().nuget)
    }

    fn dns_client_servers(&self) -> Result<Vec<String>> {
        Ok(self.world.borrow().dns_servers.clone())
    }

    fn dns_forwarders(&self) -> Result<Vec<String>> {
        Ok(self.world.borrow().dns_forwarders.clone())
    }

    fn group_members(&self, group: &str) -> Result<Vec<String>> {
        Ok(self
            .world
            .borrow()
            .groups
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    fn machine_env(&self, name: &str) -> Result<Option<String>> {
        Ok(self.world.borrow().machine_env.get(name).cloned())
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.world
            .borrow()
            .files
            .keys()
            .any(|f| f.starts_with(path))
    }

    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self.world.borrow().files.get(path).cloned())
    }
}

impl Operations for FakeNode {
    fn set_local_user_password(&self, user: &str, _password: &Secret) -> Result<()> {
        self.check("set_local_user_password")?;
        self.world.borrow_mut().local_users.insert(user.to_string());
        self.act(format!("set-password {user}"));
        Ok(())
    }

    fn add_group_member(&self, group: &str, member: &str) -> Result<()> {
        self.check("add_group_member")?;
        self.world
            .borrow_mut()
            .groups
            .entry(group.to_string())
            .or_default()
            .push(member.to_string());
        self.act(format!("add-member {group} {member}"));
        Ok(())
    }

    fn set_dns_client_servers(&self, servers: &[String]) -> Result<()> {
        self.world.borrow_mut().dns_servers = servers.to_vec();
        self.act(format!("set-dns {}", servers.join(",")));
        Ok(())
    }

    fn join_domain(&self, domain: &str, user: &str, _password: &Secret) -> Result<()> {
        self.check("join_domain")?;
        let mut world = self.world.borrow_mut();
        world.part_of_domain = true;
        world.domain_role = DomainRole::MemberServer;
        drop(world);
        self.act(format!("join-domain {domain} as {user}"));
        Ok(())
    }

    fn promote_domain_controller(&self, domain: &str, _password: &Secret) -> Result<()> {
        self.check("promote_domain_controller")?;
        let mut world = self.world.borrow_mut();
        world.part_of_domain = true;
        world.domain_role = DomainRole::PrimaryDomainController;
        drop(world);
        self.act(format!("promote-dc {domain}"));
        Ok(())
    }

    fn add_dns_forwarder(&self, address: &str) -> Result<()> {
        self.world
            .borrow_mut()
            .dns_forwarders
            .push(address.to_string());
        self.act(format!("add-forwarder {address}"));
        Ok(())
    }

    fn uninstall_update(&self, kb: &str) -> Result<i32> {
        self.check("uninstall_update")?;
        let code = self.exit_code("uninstall_update");
        if code == 0 {
            self.world.borrow_mut().updates.remove(kb);
        }
        self.act(format!("uninstall {kb}"));
        Ok(code)
    }

    fn import_certificate(&self, store: &str, _pfx: &Path, _password: &Secret) -> Result<()> {
        self.check("import_certificate")?;
        self.world.borrow_mut().cert_stores.insert(store.to_string());
        self.act(format!("import-cert {store}"));
        Ok(())
    }

    fn set_registry_dword(&self, key: &str, value: &str, data: u32) -> Result<()> {
        self.world
            .borrow_mut()
            .registry
            .insert((key.to_string(), value.to_string()), data);
        self.act(format!("set-registry {value}={data}"));
        Ok(())
    }

    fn install_nuget_provider(&self) -> Result<()> {
        self.world.borrow_mut().nuget = true;
        self.act("install-nuget");
        Ok(())
    }

    fn enable_winrm(&self) -> Result<()> {
        self.world.borrow_mut().wsman = true;
        self.act("enable-winrm");
        Ok(())
    }

    fn install_netfx(&self, _installer: &Path) -> Result<i32> {
        let code = self.exit_code("install_netfx");
        if matches!(code, 0 | 3010 | 1641) {
            self.world
                .borrow_mut()
                .registry
                .insert((NETFX_KEY.to_string(), "Release".to_string()), 528_040);
        }
        self.act("install-netfx");
        Ok(code)
    }

    fn install_head_node(&self, install: &HeadNodeInstall) -> Result<i32> {
        let code = self.exit_code("install_head_node");
        if code == 0 {
            self.world
                .borrow_mut()
                .services
                .insert("HpcManagement".to_string(), ServiceStatus::Running);
        }
        self.act(format!("install-head-node {}", install.cluster_name));
        Ok(code)
    }

    fn install_compute_node(&self, install: &ComputeNodeInstall) -> Result<i32> {
        let code = self.exit_code("install_compute_node");
        if code == 0 {
            let mut world = self.world.borrow_mut();
            world
                .services
                .insert("HpcManagement".to_string(), ServiceStatus::Running);
            world.register();
        }
        self.act(format!("install-compute-node {}", install.connection_string));
        Ok(code)
    }

    fn install_broker_node(&self, install: &BrokerNodeInstall) -> Result<i32> {
        let code = self.exit_code("install_broker_node");
        if code == 0 {
            let mut world = self.world.borrow_mut();
            world
                .services
                .insert("HpcManagement".to_string(), ServiceStatus::Running);
            world.register();
        }
        self.act(format!("install-broker-node {}", install.head_node));
        Ok(code)
    }

    fn register_task(&self, task: &ScheduledTask) -> Result<()> {
        self.check("register_task")?;
        self.world
            .borrow_mut()
            .tasks
            .insert(task.name.clone(), task.clone());
        self.act(format!("register-task {}", task.name));
        Ok(())
    }

    fn set_machine_env(&self, name: &str, value: &str) -> Result<()> {
        self.world
            .borrow_mut()
            .machine_env
            .insert(name.to_string(), value.to_string());
        self.act(format!("set-env {name}={value}"));
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.world
            .borrow_mut()
            .files
            .insert(path.to_path_buf(), contents.to_vec());
        self.act(format!("write {}", path.display()));
        Ok(())
    }
}

impl ClusterManager for FakeNode {
    fn node(&self, name: &str) -> Result<Option<ClusterNode>> {
        self.check("node")?;
        Ok(self.world.borrow().cluster_nodes.get(name).cloned())
    }

    fn template_exists(&self, template: &str) -> Result<bool> {
        self.check("template_exists")?;
        Ok(self.world.borrow().templates.contains(template))
    }

    fn assign_template(&self, node: &str, template: &str) -> Result<()> {
        self.check("assign_template")?;
        if let Some(n) = self.world.borrow_mut().cluster_nodes.get_mut(node) {
            n.health = NodeHealth::Ok;
        }
        self.act(format!("assign-template {node} {template}"));
        Ok(())
    }

    fn set_node_state(&self, node: &str, online: bool) -> Result<()> {
        self.check("set_node_state")?;
        if let Some(n) = self.world.borrow_mut().cluster_nodes.get_mut(node) {
            n.state = if online {
                NodeState::Online
            } else {
                NodeState::Offline
            };
        }
        self.act(format!("set-node-state {node} online={online}"));
        Ok(())
    }

    fn set_node_location(&self, node: &str, data_center: &str, rack: &str) -> Result<()> {
        if let Some(n) = self.world.borrow_mut().cluster_nodes.get_mut(node) {
            n.location = format!("{data_center}\\{rack}");
        }
        self.act(format!("set-location {node} {data_center}/{rack}"));
        Ok(())
    }

    fn cluster_property(&self, name: &str) -> Result<Option<String>> {
        Ok(self.world.borrow().cluster_properties.get(name).cloned())
    }

    fn set_cluster_property(&self, name: &str, value: &str) -> Result<()> {
        self.check("set_cluster_property")?;
        self.world
            .borrow_mut()
            .cluster_properties
            .insert(name.to_string(), value.to_string());
        self.act(format!("set-cluster-property {name}={value}"));
        Ok(())
    }
}

impl PackageFetcher for FakeNode {
    fn download(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.check("download")?;
        let path = dest_dir.join(name);
        self.world
            .borrow_mut()
            .files
            .insert(path.clone(), name.as_bytes().to_vec());
        self.act(format!("download {name}"));
        Ok(path)
    }

    fn unpack(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut world = self.world.borrow_mut();
        let Some(contents) = world.archives.get(&name).cloned() else {
            bail!("Unsupported archive format: {}", archive.display());
        };
        for file in contents {
            world.files.insert(dest_dir.join(file), Vec::new());
        }
        drop(world);
        self.act(format!("unpack {name}"));
        Ok(())
    }

    fn copy_tree(&self, source: &Path, dest: &Path, entries: &[&str]) -> Result<usize> {
        self.check("copy_tree")?;
        let mut world = self.world.borrow_mut();
        if !world.share_available {
            bail!("{} not found", source.display());
        }
        for entry in entries {
            world.files.insert(dest.join(entry), Vec::new());
        }
        drop(world);
        self.act(format!("copy-tree {}", source.display()));
        Ok(entries.len())
    }
}

impl SecretStore for FakeNode {
    fn get_secret(&self, vault: &str, key: &str) -> Result<String> {
        self.check("get_secret")?;
        match self.world.borrow().secrets.get(&format!("{vault}/{key}")) {
            Some(value) => Ok(value.clone()),
            None => bail!("SecretNotFound: {key}"),
        }
    }
}

impl RebootPlatform for FakeNode {
    fn ensure_reentry_task(&self) -> Result<()> {
        self.check("ensure_reentry_task")?;
        self.reentry_calls.set(self.reentry_calls.get() + 1);
        Ok(())
    }

    fn reboot(&self) -> Result<()> {
        self.reboots.set(self.reboots.get() + 1);
        self.act("reboot");
        Ok(())
    }
}
