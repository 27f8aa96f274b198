//! Windows implementation of the collaborator traits
//!
//! Each probe or operation is a short PowerShell script. Secrets are handed
//! to the script through environment variables of the child process and
//! never appear in the script text or the logged command line.

use super::{
    BrokerCertificate, BrokerNodeInstall, ClusterManager, ClusterNode, ComputeNodeInstall,
    DomainRole, HeadNodeInstall, NodeHealth, NodeState, Operations, RegisteredTask, ScheduledTask,
    ServiceStatus, SystemProbe,
};
use crate::runner::{Invocation, Output};
use crate::secrets::Secret;
use anyhow::{Context, Result};
use convergence::{LockInfo, RebootPlatform};
use std::path::Path;
use std::time::Duration;

const POWERSHELL: &str = "powershell.exe";

const ENV_SECRET: &str = "HPCNODE_SECRET";
const ENV_USER: &str = "HPCNODE_USER";
const ENV_PFX_PASSWORD: &str = "HPCNODE_PFX_PASSWORD";
const ENV_RUNAS_USER: &str = "HPCNODE_RUNAS_USER";
const ENV_RUNAS_PASSWORD: &str = "HPCNODE_RUNAS_PASSWORD";

/// Probes and operations take a few seconds; installers can take an hour
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(600);
const INSTALLER_TIMEOUT: Duration = Duration::from_secs(3 * 3600);

/// Quote a value as a PowerShell single-quoted literal
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

fn secure_string(env: &str) -> String {
    format!(
        "$(if ($env:{env}) {{ ConvertTo-SecureString $env:{env} -AsPlainText -Force }} else {{ New-Object System.Security.SecureString }})"
    )
}

fn parse_bool(output: &str) -> Result<bool> {
    match output.trim() {
        "True" | "true" => Ok(true),
        "False" | "false" | "" => Ok(false),
        other => anyhow::bail!("Expected True or False, got '{other}'"),
    }
}

fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Local node backed by `powershell.exe`
#[derive(Debug, Clone, Default)]
pub struct PowerShellNode {
    /// Head node the HPC cmdlets talk to
    scheduler: Option<String>,
    /// Account HPC cmdlets run as
    run_as: Option<(String, Secret)>,
}

impl PowerShellNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target a scheduler, optionally running HPC cmdlets as a domain account
    pub fn with_scheduler(mut self, scheduler: &str, run_as: Option<(String, Secret)>) -> Self {
        self.scheduler = Some(scheduler.to_string());
        self.run_as = run_as;
        self
    }

    fn script(script: &str) -> Invocation<'static> {
        Invocation::new(POWERSHELL)
            .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass"])
            .arg("-Command")
            .arg(format!("$ErrorActionPreference = 'Stop'; {script}"))
            .timeout(SCRIPT_TIMEOUT)
    }

    fn capture(script: &str) -> Result<String> {
        Self::script(script).capture()
    }

    fn run(script: &str) -> Result<()> {
        Self::capture(script).map(drop)
    }

    fn run_with_secret(script: &str, secret: &Secret) -> Result<()> {
        Self::script(script)
            .secret_env(ENV_SECRET, secret.expose())
            .capture()
            .map(drop)
    }

    /// Run a script that ends with `exit $LASTEXITCODE` and return the code
    fn exit_code(invocation: Invocation<'_>) -> Result<i32> {
        let Output { code, stderr, .. } = invocation.timeout(INSTALLER_TIMEOUT).output()?;
        if code != 0 && !stderr.trim().is_empty() {
            log::debug!("Installer stderr: {}", stderr.trim());
        }
        Ok(code)
    }

    fn scheduler(&self) -> Result<&str> {
        self.scheduler
            .as_deref()
            .context("No HPC scheduler configured for cluster commands")
    }

    /// Run an HPC cmdlet script against the scheduler
    fn hpc(&self, body: &str) -> Result<String> {
        let scheduler = quote(self.scheduler()?);
        let body = format!(
            "Add-PSSnapin Microsoft.HPC; $env:CCP_SCHEDULER = {scheduler}; $scheduler = {scheduler}; {body}"
        );

        match &self.run_as {
            None => Self::capture(&body),
            Some((user, password)) => {
                let cred = format!(
                    "New-Object System.Management.Automation.PSCredential($env:{ENV_RUNAS_USER}, {})",
                    secure_string(ENV_RUNAS_PASSWORD)
                );
                let script = format!(
                    "Invoke-Command -ComputerName $env:COMPUTERNAME -Credential ({cred}) -ScriptBlock {{ $ErrorActionPreference = 'Stop'; {body} }}"
                );
                Self::script(&script)
                    .secret_env(ENV_RUNAS_USER, user)
                    .secret_env(ENV_RUNAS_PASSWORD, password.expose())
                    .capture()
            }
        }
    }
}

impl SystemProbe for PowerShellNode {
    fn hostname(&self) -> Result<String> {
        Self::capture("[System.Net.Dns]::GetHostName()")
    }

    fn service_status(&self, name: &str) -> Result<ServiceStatus> {
        let out = Self::capture(&format!(
            "$s = Get-Service -Name {} -ErrorAction SilentlyContinue; if ($s) {{ $s.Status }} else {{ 'Missing' }}",
            quote(name)
        ))?;
        Ok(match out.as_str() {
            "Missing" => ServiceStatus::Missing,
            "Running" => ServiceStatus::Running,
            _ => ServiceStatus::Stopped,
        })
    }

    fn registry_dword(&self, key: &str, value: &str) -> Result<Option<u32>> {
        let out = Self::capture(&format!(
            "(Get-ItemProperty -Path {} -Name {} -ErrorAction SilentlyContinue).{}",
            quote(key),
            quote(value),
            quote(value)
        ))?;
        if out.is_empty() {
            return Ok(None);
        }
        out.parse()
            .map(Some)
            .with_context(|| format!("{key}\\{value} is not a DWORD: '{out}'"))
    }

    fn part_of_domain(&self) -> Result<bool> {
        parse_bool(&Self::capture(
            "(Get-WmiObject -Class Win32_ComputerSystem).PartOfDomain",
        )?)
    }

    fn domain_role(&self) -> Result<DomainRole> {
        let out = Self::capture("(Get-WmiObject -Class Win32_ComputerSystem).DomainRole")?;
        let code: u32 = out
            .parse()
            .with_context(|| format!("Unexpected DomainRole '{out}'"))?;
        DomainRole::from_code(code).with_context(|| format!("Unknown DomainRole {code}"))
    }

    fn update_installed(&self, kb: &str) -> Result<bool> {
        let out = Invocation::new("dism.exe")
            .args(["/online", "/get-packages"])
            .timeout(SCRIPT_TIMEOUT)
            .capture()?;
        let kb = kb.to_ascii_uppercase();
        Ok(out.to_ascii_uppercase().contains(&kb))
    }

    fn certificate_installed(&self, store: &str, pfx: &Path, password: &Secret) -> Result<bool> {
        let script = format!(
            "$pfx = Get-PfxData -FilePath {} -Password {}; Test-Path (\"Cert:\\LocalMachine\\{}\\\" + $pfx.EndEntityCertificates[0].Thumbprint)",
            quote_path(pfx),
            secure_string(ENV_SECRET),
            store
        );
        let out = Self::script(&script)
            .secret_env(ENV_SECRET, password.expose())
            .capture()?;
        parse_bool(&out)
    }

    fn scheduled_task(&self, name: &str) -> Result<Option<RegisteredTask>> {
        let out = Self::capture(&format!(
            "$t = Get-ScheduledTask -TaskName {} -ErrorAction SilentlyContinue; if ($t) {{ $a = $t.Actions | Select-Object -First 1; (($a.Execute, $a.Arguments) -join ' ').Trim(); $t.Principal.UserId }}",
            quote(name)
        ))?;
        let mut fields = out.lines().map(str::trim);
        let Some(command) = fields.next().filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(RegisteredTask {
            command: command.to_string(),
            user: fields.next().unwrap_or_default().to_string(),
        }))
    }

    fn wsman_available(&self) -> Result<bool> {
        parse_bool(&Self::capture(
            "[bool](Test-WSMan -ComputerName localhost -ErrorAction SilentlyContinue)",
        )?)
    }

    fn nuget_provider_installed(&self) -> Result<bool> {
        parse_bool(&Self::capture(
            "[Net.ServicePointManager]::SecurityProtocol = [Net.SecurityProtocolType]::Tls12; [bool](Get-PackageProvider -Name NuGet -ListAvailable -ErrorAction SilentlyContinue)",
        )?)
    }

    fn dns_client_servers(&self) -> Result<Vec<String>> {
        Ok(lines(&Self::capture(
            "Get-DnsClientServerAddress -AddressFamily IPv4 | Where-Object { $_.ServerAddresses } | Select-Object -First 1 -ExpandProperty ServerAddresses",
        )?))
    }

    fn dns_forwarders(&self) -> Result<Vec<String>> {
        Ok(lines(&Self::capture(
            "[array](Get-CimInstance -Namespace root\\MicrosoftDNS -ClassName microsoftdns_server).Forwarders",
        )?))
    }

    fn group_members(&self, group: &str) -> Result<Vec<String>> {
        Ok(lines(&Self::capture(&format!(
            "Get-LocalGroupMember -Group {} | ForEach-Object {{ $_.Name }}",
            quote(group)
        ))?))
    }

    fn machine_env(&self, name: &str) -> Result<Option<String>> {
        let out = Self::capture(&format!(
            "[Environment]::GetEnvironmentVariable({}, 'Machine')",
            quote(name)
        ))?;
        Ok((!out.is_empty()).then_some(out))
    }
}

impl Operations for PowerShellNode {
    fn set_local_user_password(&self, user: &str, password: &Secret) -> Result<()> {
        let user = quote(user);
        let pw = secure_string(ENV_SECRET);
        Self::run_with_secret(
            &format!(
                "$pw = {pw}; if (Get-LocalUser -Name {user} -ErrorAction SilentlyContinue) {{ Set-LocalUser -Name {user} -Password $pw }} else {{ New-LocalUser -Name {user} -Password $pw -PasswordNeverExpires | Out-Null }}"
            ),
            password,
        )
    }

    fn add_group_member(&self, group: &str, member: &str) -> Result<()> {
        Self::run(&format!(
            "Add-LocalGroupMember -Group {} -Member {}",
            quote(group),
            quote(member)
        ))
    }

    fn set_dns_client_servers(&self, servers: &[String]) -> Result<()> {
        let list = servers
            .iter()
            .map(|s| quote(s))
            .collect::<Vec<_>>()
            .join(",");
        Self::run(&format!(
            "Get-NetAdapter | Where-Object Status -eq 'Up' | Set-DnsClientServerAddress -ServerAddresses @({list})"
        ))
    }

    fn join_domain(&self, domain: &str, user: &str, password: &Secret) -> Result<()> {
        let script = format!(
            "$cred = New-Object System.Management.Automation.PSCredential($env:{ENV_USER}, {}); Add-Computer -DomainName {} -Credential $cred -Force",
            secure_string(ENV_SECRET),
            quote(domain)
        );
        Self::script(&script)
            .secret_env(ENV_USER, user)
            .secret_env(ENV_SECRET, password.expose())
            .capture()
            .map(drop)
    }

    fn promote_domain_controller(&self, domain: &str, safe_mode_password: &Secret) -> Result<()> {
        Self::run_with_secret(
            &format!(
                "Import-Module ServerManager; $f = Get-WindowsFeature -Name AD-Domain-Services; if (-not $f.Installed) {{ Install-WindowsFeature -Name AD-Domain-Services -IncludeManagementTools | Out-Null }}; Import-Module ADDSDeployment; Install-ADDSForest -DomainName {} -InstallDns -SafeModeAdministratorPassword {} -NoRebootOnCompletion -Force | Out-Null",
                quote(domain),
                secure_string(ENV_SECRET)
            ),
            safe_mode_password,
        )
    }

    fn add_dns_forwarder(&self, address: &str) -> Result<()> {
        Self::run(&format!(
            "Add-DnsServerForwarder -IPAddress {} | Out-Null",
            quote(address)
        ))
    }

    fn uninstall_update(&self, kb: &str) -> Result<i32> {
        let number = kb.trim_start_matches(['K', 'B', 'k', 'b']);
        let out = Invocation::new("wusa.exe")
            .args(["/uninstall".to_string(), format!("/kb:{number}")])
            .args(["/norestart", "/quiet"])
            .timeout(INSTALLER_TIMEOUT)
            .output()?;
        Ok(out.code)
    }

    fn import_certificate(&self, store: &str, pfx: &Path, password: &Secret) -> Result<()> {
        Self::run_with_secret(
            &format!(
                "Import-PfxCertificate -FilePath {} -CertStoreLocation Cert:\\LocalMachine\\{store} -Exportable -Password {} | Out-Null",
                quote_path(pfx),
                secure_string(ENV_SECRET)
            ),
            password,
        )
    }

    fn set_registry_dword(&self, key: &str, value: &str, data: u32) -> Result<()> {
        let key = quote(key);
        Self::run(&format!(
            "if (-not (Test-Path {key})) {{ New-Item -Path {key} -Force | Out-Null }}; Set-ItemProperty -Path {key} -Name {} -Value {data} -Type DWord",
            quote(value)
        ))
    }

    fn install_nuget_provider(&self) -> Result<()> {
        Self::run(
            "[Net.ServicePointManager]::SecurityProtocol = [Net.SecurityProtocolType]::Tls12; Install-PackageProvider -Name NuGet -MinimumVersion 2.8.5.201 -Force | Out-Null",
        )
    }

    fn enable_winrm(&self) -> Result<()> {
        Invocation::new("winrm.cmd")
            .args(["quickconfig", "-quiet"])
            .timeout(SCRIPT_TIMEOUT)
            .capture()
            .map(drop)
    }

    fn install_netfx(&self, installer: &Path) -> Result<i32> {
        let log = installer.with_extension("log");
        let web = installer
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with("-web.exe"));
        let extra = if web { " /serialdownload" } else { "" };
        Self::exit_code(Self::script(&format!(
            "$p = Start-Process -FilePath {} -ArgumentList ('/q /norestart{extra} /log \"' + {} + '\"') -Wait -PassThru; exit $p.ExitCode",
            quote_path(installer),
            quote_path(&log)
        )))
    }

    fn install_head_node(&self, install: &HeadNodeInstall) -> Result<i32> {
        let script = format!(
            "$domainCred = New-Object System.Management.Automation.PSCredential($env:{ENV_USER}, {}); & {} -ClusterName {} -SetupFilePath {} -PfxFilePath {} -PfxFilePassword {} -SetupCredential $domainCred; exit $LASTEXITCODE",
            secure_string(ENV_SECRET),
            quote_path(&install.script),
            quote(&install.cluster_name),
            quote_path(&install.setup_file),
            quote_path(&install.pfx),
            secure_string(ENV_PFX_PASSWORD)
        );
        Self::exit_code(
            Self::script(&script)
                .secret_env(ENV_USER, &install.domain_user)
                .secret_env(ENV_SECRET, install.domain_password.expose())
                .secret_env(ENV_PFX_PASSWORD, install.pfx_password.expose()),
        )
    }

    fn install_compute_node(&self, install: &ComputeNodeInstall) -> Result<i32> {
        let script = format!(
            "& {} -ClusterConnectionString {} -PfxFilePath {} -PfxFilePassword {}; exit $LASTEXITCODE",
            quote_path(&install.script),
            quote(&install.connection_string),
            quote_path(&install.pfx),
            secure_string(ENV_PFX_PASSWORD)
        );
        Self::exit_code(
            Self::script(&script).secret_env(ENV_PFX_PASSWORD, install.pfx_password.expose()),
        )
    }

    fn install_broker_node(&self, install: &BrokerNodeInstall) -> Result<i32> {
        let base = format!(
            "& {} -SetupFilePath {} -ClusterConnectionString {}",
            quote_path(&install.script),
            quote_path(&install.setup_file),
            quote(&install.head_node)
        );
        match &install.certificate {
            BrokerCertificate::Vault { vault, cert_name } => Self::exit_code(Self::script(&format!(
                "{base} -VaultName {} -VaultCertName {}; exit $LASTEXITCODE",
                quote(vault),
                quote(cert_name)
            ))),
            BrokerCertificate::Pfx { path, password } => Self::exit_code(
                Self::script(&format!(
                    "{base} -PfxFilePath {} -PfxFilePassword {}; exit $LASTEXITCODE",
                    quote_path(path),
                    secure_string(ENV_PFX_PASSWORD)
                ))
                .secret_env(ENV_PFX_PASSWORD, password.expose()),
            ),
        }
    }

    fn register_task(&self, task: &ScheduledTask) -> Result<()> {
        let mut args = vec![
            "/Create".to_string(),
            "/F".to_string(),
            "/TN".to_string(),
            task.name.clone(),
            "/TR".to_string(),
            task.command.clone(),
            "/SC".to_string(),
            "MINUTE".to_string(),
            "/MO".to_string(),
            task.every_minutes.to_string(),
        ];

        match &task.run_as {
            None => {
                args.extend(["/RU".to_string(), "SYSTEM".to_string()]);
                Invocation::new("schtasks.exe").args(args).capture()?;
            }
            Some((user, password)) => {
                // schtasks only takes the password as an argument, so go
                // through PowerShell to keep it off the command line
                let script = format!(
                    "schtasks.exe {} /RU $env:{ENV_USER} /RP $env:{ENV_SECRET}; if ($LASTEXITCODE -ne 0) {{ throw \"schtasks exited with $LASTEXITCODE\" }}",
                    args.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ")
                );
                Self::script(&script)
                    .secret_env(ENV_USER, user)
                    .secret_env(ENV_SECRET, password.expose())
                    .capture()?;
            }
        }
        log::debug!("Registered scheduled task {}", task.name);
        Ok(())
    }

    fn set_machine_env(&self, name: &str, value: &str) -> Result<()> {
        Self::run(&format!(
            "[Environment]::SetEnvironmentVariable({}, {}, 'Machine')",
            quote(name),
            quote(value)
        ))
    }
}

impl ClusterManager for PowerShellNode {
    fn node(&self, name: &str) -> Result<Option<ClusterNode>> {
        let out = self.hpc(&format!(
            "$n = Get-HpcNode -Name {} -Scheduler $scheduler -ErrorAction SilentlyContinue; if ($n) {{ $n.NetBiosName; $n.HealthState; $n.NodeState; $n.Location }}",
            quote(name)
        ))?;
        let mut fields = out.lines().map(str::trim);
        let Some(node_name) = fields.next().filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(ClusterNode {
            name: node_name.to_string(),
            health: NodeHealth::parse(fields.next().unwrap_or_default()),
            state: NodeState::parse(fields.next().unwrap_or_default()),
            location: fields.next().unwrap_or_default().to_string(),
        }))
    }

    fn template_exists(&self, template: &str) -> Result<bool> {
        parse_bool(&self.hpc(&format!(
            "[bool](Get-HpcNodeTemplate -Name {} -Scheduler $scheduler -ErrorAction SilentlyContinue)",
            quote(template)
        ))?)
    }

    fn assign_template(&self, node: &str, template: &str) -> Result<()> {
        self.hpc(&format!(
            "Assign-HpcNodeTemplate -NodeName {} -Name {} -Confirm:$false -Scheduler $scheduler | Out-Null",
            quote(node),
            quote(template)
        ))
        .map(drop)
    }

    fn set_node_state(&self, node: &str, online: bool) -> Result<()> {
        let state = if online { "Online" } else { "Offline" };
        self.hpc(&format!(
            "Set-HpcNodeState -Name {} -State {state} -Scheduler $scheduler | Out-Null",
            quote(node)
        ))
        .map(drop)
    }

    fn set_node_location(&self, node: &str, data_center: &str, rack: &str) -> Result<()> {
        self.hpc(&format!(
            "Set-HpcNode -Name {} -DataCenter {} -Rack {} -Scheduler $scheduler | Out-Null",
            quote(node),
            quote(data_center),
            quote(rack)
        ))
        .map(drop)
    }

    fn cluster_property(&self, name: &str) -> Result<Option<String>> {
        let out = self.hpc(&format!(
            "(Get-HpcClusterProperty -Parameter -Name {} -Scheduler $scheduler).Value",
            quote(name)
        ))?;
        Ok((!out.is_empty()).then_some(out))
    }

    fn set_cluster_property(&self, name: &str, value: &str) -> Result<()> {
        self.hpc(&format!(
            "Set-HpcClusterProperty -{name} {} -Scheduler $scheduler | Out-Null",
            quote(value)
        ))
        .map(drop)
    }
}

/// Script printing whether the pass that wrote `holder` can still be running
fn holder_alive_script(holder: &LockInfo) -> String {
    format!(
        "$boot = (Get-CimInstance Win32_OperatingSystem).LastBootUpTime.ToUniversalTime(); \
         $acquired = [DateTime]::Parse({}, [Globalization.CultureInfo]::InvariantCulture, \
         [Globalization.DateTimeStyles]::RoundtripKind).ToUniversalTime(); \
         if ($acquired -lt $boot) {{ $false }} \
         else {{ [bool](Get-Process -Id {} -ErrorAction SilentlyContinue) }}",
        quote(&holder.acquired_at.to_rfc3339()),
        holder.pid
    )
}

/// Boot-time re-entry and OS restart
#[derive(Debug, Clone)]
pub struct WindowsReboot {
    task_name: String,
    command: String,
}

impl WindowsReboot {
    pub fn new(task_name: &str, command: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            command: command.to_string(),
        }
    }
}

impl RebootPlatform for WindowsReboot {
    fn ensure_reentry_task(&self) -> Result<()> {
        Invocation::new("schtasks.exe")
            .args([
                "/Create",
                "/TN",
                self.task_name.as_str(),
                "/TR",
                self.command.as_str(),
            ])
            .args(["/SC", "ONSTART", "/F", "/RU", "System"])
            .timeout(SCRIPT_TIMEOUT)
            .capture()
            .with_context(|| format!("Failed to register boot task {}", self.task_name))
            .map(drop)
    }

    fn reboot(&self) -> Result<()> {
        Invocation::new("shutdown.exe")
            .args(["/r", "/t", "5", "/c", "hpcnode: resuming convergence after reboot"])
            .capture()
            .context("Failed to schedule reboot")
            .map(drop)
    }
    fn holder_alive(&self, holder: &LockInfo) -> bool {
        match PowerShellNode::capture(&holder_alive_script(holder)).and_then(|out| parse_bool(&out))
        {
            Ok(alive) => alive,
            Err(e) => {
                log::warn!("Could not check pass lock holder {}: {e:#}", holder.pid);
                true
            }
        }
    }
}
