//! .NET Framework, TLS and remoting prerequisites of HPC Pack

use crate::config::NodeConfig;
use crate::node::{NodeEnv, NodeStep, installer_outcome, transient};
use convergence::ActionResult;

/// Installed .NET Framework 4.x release
pub const NETFX_KEY: &str = r"HKLM:\SOFTWARE\Microsoft\NET Framework Setup\NDP\v4\Full";

/// .NET must negotiate TLS 1.2 for both 64 and 32 bit processes
const STRONG_CRYPTO_KEYS: [&str; 2] = [
    r"HKLM:\SOFTWARE\Microsoft\.NetFramework\v4.0.30319",
    r"HKLM:\SOFTWARE\Wow6432Node\Microsoft\.NetFramework\v4.0.30319",
];
const STRONG_CRYPTO_VALUE: &str = "SchUseStrongCrypto";

fn netfx_current(env: &NodeEnv) -> anyhow::Result<bool> {
    let release = env.probe.registry_dword(NETFX_KEY, "Release")?;
    Ok(release.is_some_and(|r| r >= env.config.version.min_netfx_release()))
}

fn strong_crypto_enabled(env: &NodeEnv) -> anyhow::Result<bool> {
    for key in STRONG_CRYPTO_KEYS {
        if env.probe.registry_dword(key, STRONG_CRYPTO_VALUE)? != Some(1) {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn steps(config: &NodeConfig) -> Vec<NodeStep> {
    vec![
        NodeStep::new("fetch-netfx", "Download the .NET Framework installer", |env| {
            env.packages
                .download(&env.config.packages.netfx_installer, &env.config.downloads_dir())
                .map_err(transient)?;
            Ok(ActionResult::Done)
        })
        .not_if(".NET Framework is recent enough", netfx_current)
        .retry(config.retries.download.policy()),
        NodeStep::new("install-netfx", "Install the .NET Framework", |env| {
            let installer = env
                .config
                .downloads_dir()
                .join(&env.config.packages.netfx_installer);
            let code = env.ops.install_netfx(&installer)?;
            installer_outcome(".NET Framework setup", code)
        })
        .not_if(".NET Framework is recent enough", netfx_current)
        .reboot_now(),
        NodeStep::new(
            "enable-strong-crypto",
            "Enable strong cryptography for .NET",
            |env| {
                for key in STRONG_CRYPTO_KEYS {
                    env.ops.set_registry_dword(key, STRONG_CRYPTO_VALUE, 1)?;
                }
                Ok(ActionResult::Done)
            },
        )
        .not_if("SchUseStrongCrypto is set", strong_crypto_enabled),
        NodeStep::new(
            "install-nuget-provider",
            "Install the NuGet package provider",
            |env| {
                env.ops.install_nuget_provider().map_err(transient)?;
                Ok(ActionResult::Done)
            },
        )
        .not_if("NuGet provider is installed", |env| {
            env.probe.nuget_provider_installed()
        }),
        NodeStep::new("enable-winrm", "Enable Windows Remote Management", |env| {
            env.ops.enable_winrm()?;
            Ok(ActionResult::Done)
        })
        .not_if("WS-Man answers", |env| env.probe.wsman_available()),
    ]
}
