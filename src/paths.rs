//! Centralized path resolution for hpcnode
//!
//! # Environment Variables
//!
//! - `HPCNODE_CONFIG` - Override the config file path
//! - `HPCNODE_STATE_DIR` - Override the state directory
//!
//! # Path Resolution Priority
//!
//! For config_file():
//! 1. `--config` flag
//! 2. `HPCNODE_CONFIG` environment variable
//! 3. Platform default:
//!    - Windows: `%ProgramData%\hpcnode\config.toml`
//!    - Other: `~/.config/hpcnode/config.toml`
//!
//! For state_dir():
//! 1. `--state-dir` flag
//! 2. `HPCNODE_STATE_DIR` environment variable
//! 3. Platform default:
//!    - Windows: `%ProgramData%\hpcnode\state`
//!    - Other: `~/.local/state/hpcnode`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for config file override
pub const ENV_CONFIG: &str = "HPCNODE_CONFIG";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "HPCNODE_STATE_DIR";

const LOCK_FILE: &str = "hpcnode.lock";

/// Resolve the config file path
pub fn config_file(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path.to_path_buf());
    }

    if let Ok(file) = std::env::var(ENV_CONFIG) {
        let path = expand(&file);
        log::debug!("Using config file from {}: {}", ENV_CONFIG, path.display());
        return Ok(path);
    }

    let path = base_dir()?.join("config.toml");
    log::debug!("Using default config file: {}", path.display());
    Ok(path)
}

/// Resolve the state directory
pub fn state_dir(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path.to_path_buf());
    }

    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        let path = base_dir()?.join("state");
        log::debug!("Using Windows state dir: {}", path.display());
        Ok(path)
    }

    #[cfg(not(windows))]
    {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        let path = home.join(".local").join("state").join("hpcnode");
        log::debug!("Using default state dir: {}", path.display());
        Ok(path)
    }
}

/// Lock file inside a state directory
pub fn lock_file(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}

#[cfg(windows)]
fn base_dir() -> Result<PathBuf> {
    // Machine-wide: the agent runs as SYSTEM from the boot task
    let program_data = std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".into());
    Ok(PathBuf::from(program_data).join("hpcnode"))
}

#[cfg(not(windows))]
fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("hpcnode"))
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
