//! Test doubles shared by the engine's unit tests

use crate::lock::LockInfo;
use crate::reboot::RebootPlatform;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;

/// Reboot platform that counts calls
#[derive(Default)]
pub struct RecordingReboot {
    reentry: Cell<usize>,
    reboots: Cell<usize>,
    fail_reentry: bool,
    /// Report every lock holder as gone, as after a reboot
    dead_holders: bool,
}

impl RecordingReboot {
    pub fn failing_reentry() -> Self {
        Self {
            fail_reentry: true,
            ..Default::default()
        }
    }

    pub fn with_dead_holders() -> Self {
        Self {
            dead_holders: true,
            ..Default::default()
        }
    }

    pub fn reentry_calls(&self) -> usize {
        self.reentry.get()
    }

    pub fn reboots(&self) -> usize {
        self.reboots.get()
    }
}

impl RebootPlatform for RecordingReboot {
    fn ensure_reentry_task(&self) -> anyhow::Result<()> {
        self.reentry.set(self.reentry.get() + 1);
        if self.fail_reentry {
            anyhow::bail!("schtasks exited with 1");
        }
        Ok(())
    }

    fn reboot(&self) -> anyhow::Result<()> {
        self.reboots.set(self.reboots.get() + 1);
        Ok(())
    }

    fn holder_alive(&self, holder: &LockInfo) -> bool {
        !self.dead_holders && crate::lock::process_alive(holder.pid)
    }
}

/// Environment whose "machine state" is a set of facts
#[derive(Default)]
pub struct FactEnv {
    facts: RefCell<HashSet<String>>,
    actions: RefCell<Vec<String>>,
}

impl FactEnv {
    pub fn has(&self, fact: &str) -> bool {
        self.facts.borrow().contains(fact)
    }

    pub fn set(&self, fact: &str) {
        self.facts.borrow_mut().insert(fact.to_string());
    }

    /// Record that an action ran
    pub fn act(&self, id: &str) {
        self.actions.borrow_mut().push(id.to_string());
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.borrow().clone()
    }

    pub fn clear_actions(&self) {
        self.actions.borrow_mut().clear();
    }
}
