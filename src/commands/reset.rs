use anyhow::{Result, bail};
use convergence::{FileStateStore, PassLock, StateStore};
use std::path::Path;

use crate::Context;
use crate::paths;
use crate::ui;

pub fn run(ctx: &Context, yes: bool) -> Result<()> {
    let state_dir = paths::state_dir(ctx.state_dir.as_deref())?;

    if !yes && !confirm_reset()? {
        ui::info("Reset cancelled");
        return Ok(());
    }

    reset(&state_dir)?;
    ui::success("Convergence state cleared; the next pass starts from the first step");
    Ok(())
}

/// Remove the in-progress and archived state.
///
/// Refuses while a pass holds the lock.
pub fn reset(state_dir: &Path) -> Result<()> {
    if let Some(holder) = PassLock::holder(&paths::lock_file(state_dir)) {
        bail!(
            "A pass is running (pid {}, since {}); not resetting",
            holder.pid,
            holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    FileStateStore::new(state_dir).clear()?;
    log::info!("Cleared state in {}", state_dir.display());
    Ok(())
}

fn confirm_reset() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Forget all convergence progress on this node?")
        .default(false)
        .interact()?;

    Ok(confirmed)
}
