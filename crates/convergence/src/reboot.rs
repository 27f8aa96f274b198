//! Reboot coordination
//!
//! ```text
//! Running --request--> RebootPending --issue--> AwaitingReentry
//!    ^                                                |
//!    +-------------- resume (next pass) --------------+
//! ```

use crate::error::{Error, Result};
use crate::lock::{self, LockInfo};
use crate::state::{ConvergenceState, StateStore};

/// OS hooks needed to survive a reboot
pub trait RebootPlatform {
    /// Register the boot-time task that re-runs the agent.
    /// Must overwrite an existing registration.
    fn ensure_reentry_task(&self) -> anyhow::Result<()>;

    /// Ask the OS to restart
    fn reboot(&self) -> anyhow::Result<()>;

    /// Whether the pass recorded in a leftover lock file can still be
    /// running. A lock written before the last boot never is.
    fn holder_alive(&self, holder: &LockInfo) -> bool {
        lock::process_alive(holder.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPhase {
    Running,
    RebootPending,
    AwaitingReentry,
}

/// Drives the reboot state machine for one pass
pub struct RebootCoordinator<'a> {
    platform: &'a dyn RebootPlatform,
    phase: RebootPhase,
    reentry_ensured: bool,
    allow_reboot: bool,
}

impl<'a> RebootCoordinator<'a> {
    pub fn new(platform: &'a dyn RebootPlatform, allow_reboot: bool) -> Self {
        Self {
            platform,
            phase: RebootPhase::Running,
            reentry_ensured: false,
            allow_reboot,
        }
    }

    pub fn phase(&self) -> RebootPhase {
        self.phase
    }

    /// Clear a persisted reboot request at the start of a pass.
    ///
    /// Returns `true` if this pass is a re-entry after a reboot.
    pub fn resume(&mut self, state: &mut ConvergenceState) -> bool {
        if !state.pending_reboot {
            return false;
        }
        self.phase = RebootPhase::AwaitingReentry;
        log::info!(
            "Re-entered after reboot (last completed step: {})",
            state.last_completed_step.as_deref().unwrap_or("none")
        );
        state.pending_reboot = false;
        self.phase = RebootPhase::Running;
        true
    }

    /// Register the re-entry task, at most once per pass
    pub fn ensure_reentry(&mut self) -> Result<()> {
        if self.reentry_ensured {
            return Ok(());
        }
        self.platform
            .ensure_reentry_task()
            .map_err(|e| Error::Reboot {
                message: format!("failed to register re-entry task: {e:#}"),
            })?;
        self.reentry_ensured = true;
        Ok(())
    }

    /// Persist a reboot request made by `step` and make sure the agent
    /// runs again after boot.
    pub fn request(
        &mut self,
        state: &mut ConvergenceState,
        store: &dyn StateStore,
        step: &str,
    ) -> Result<()> {
        state.pending_reboot = true;
        state.deferred_reboot = None;
        state.reboots += 1;
        state.touch();
        store.save(state)?;
        self.ensure_reentry()?;
        self.phase = RebootPhase::RebootPending;
        log::warn!("Reboot requested by '{step}'");
        Ok(())
    }

    /// Issue the OS reboot. Returns `false` if reboots are disabled.
    pub fn issue(&mut self) -> Result<bool> {
        if self.phase != RebootPhase::RebootPending {
            return Ok(false);
        }
        if !self.allow_reboot {
            log::warn!("Reboots are disabled; restart the node to continue convergence");
            return Ok(false);
        }
        self.platform.reboot().map_err(|e| Error::Reboot {
            message: format!("failed to reboot: {e:#}"),
        })?;
        self.phase = RebootPhase::AwaitingReentry;
        Ok(true)
    }
}
