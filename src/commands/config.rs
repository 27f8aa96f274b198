use anyhow::{Context as _, Result};

use crate::Context;
use crate::cli::ConfigCommand;
use crate::config::NodeConfig;
use crate::paths;
use crate::secrets::REDACTED;
use crate::ui;

pub fn run(ctx: &Context, cmd: ConfigCommand) -> Result<()> {
    let path = paths::config_file(ctx.config.as_deref())?;
    match cmd {
        ConfigCommand::Show => show(&path),
        ConfigCommand::Validate(args) => validate(&path, args.role),
    }
}

fn show(path: &std::path::Path) -> Result<()> {
    let config = NodeConfig::load(path)?;

    ui::header("Configuration");
    ui::kv("File", &path.display().to_string());
    if !path.exists() {
        ui::dim("File not found; showing defaults");
    }
    println!();

    let text = toml::to_string_pretty(&redacted(config))
        .context("Failed to serialize configuration")?;
    print!("{text}");
    Ok(())
}

fn validate(path: &std::path::Path, role: Option<crate::role::Role>) -> Result<()> {
    let config = NodeConfig::load(path)?;
    let role = config.resolve_role(role)?;
    config
        .validate(role)
        .with_context(|| format!("{} is not valid for {role}", path.display()))?;

    ui::success(&format!("{} is valid for {role}", path.display()));
    Ok(())
}

/// Copy of the config with inline secrets masked
fn redacted(mut config: NodeConfig) -> NodeConfig {
    for field in [
        &mut config.ad.admin_password,
        &mut config.cert.password,
        &mut config.autoscale.cyclecloud.password,
    ] {
        if field.is_some() {
            *field = Some(REDACTED.to_string());
        }
    }
    config
}
