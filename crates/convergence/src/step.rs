//! Step and guard definitions
//!
//! A [`Step`] is generic over the environment `E` its action and guards
//! read from. Steps are immutable once built; the driver only ever borrows
//! them.

use crate::error::StepError;
use crate::retry::RetryPolicy;
use crate::types::{ActionResult, GuardOutcome};
use std::fmt;
use std::time::Duration;

type ActionFn<E> = Box<dyn Fn(&E) -> Result<ActionResult, StepError>>;
type ProbeFn<E> = Box<dyn Fn(&E) -> anyhow::Result<bool>>;

/// A side-effect free probe attached to a step
pub struct Guard<E> {
    description: String,
    probe: ProbeFn<E>,
}

impl<E> Guard<E> {
    pub fn new(
        description: impl Into<String>,
        probe: impl Fn(&E) -> anyhow::Result<bool> + 'static,
    ) -> Self {
        Self {
            description: description.into(),
            probe: Box::new(probe),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Run the probe
    pub fn evaluate(&self, env: &E) -> GuardOutcome {
        GuardOutcome::from_probe((self.probe)(env))
    }
}

impl<E> fmt::Debug for Guard<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// When a successful step reboots the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootTiming {
    /// Reboot right after the step
    Immediate,
    /// Reboot at the next checkpoint, or at the end of the pass
    Deferred,
}

/// What a step does when it is due
pub enum StepKind<E> {
    Action(ActionFn<E>),
    /// Reboots only if an earlier step deferred a reboot
    RebootCheckpoint,
}

/// One unit of convergence work
pub struct Step<E> {
    id: String,
    description: String,
    kind: StepKind<E>,
    only_if: Vec<Guard<E>>,
    not_if: Vec<Guard<E>>,
    reboot: Option<RebootTiming>,
    retry: RetryPolicy,
    ignore_failure: bool,
    probe_failures_fatal: bool,
    exhaustion_message: Option<String>,
    settle: Option<Duration>,
}

impl<E> Step<E> {
    /// Create a step that runs `action` when due
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        action: impl Fn(&E) -> Result<ActionResult, StepError> + 'static,
    ) -> Self {
        Self::with_kind(id, description, StepKind::Action(Box::new(action)))
    }

    /// Create a checkpoint that honors deferred reboot requests
    pub fn reboot_checkpoint(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self::with_kind(id, description, StepKind::RebootCheckpoint)
    }

    fn with_kind(id: impl Into<String>, description: impl Into<String>, kind: StepKind<E>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind,
            only_if: Vec::new(),
            not_if: Vec::new(),
            reboot: None,
            retry: RetryPolicy::once(),
            ignore_failure: false,
            probe_failures_fatal: false,
            exhaustion_message: None,
            settle: None,
        }
    }

    /// Run only if `probe` holds
    pub fn only_if(
        mut self,
        description: impl Into<String>,
        probe: impl Fn(&E) -> anyhow::Result<bool> + 'static,
    ) -> Self {
        self.only_if.push(Guard::new(description, probe));
        self
    }

    /// Skip if `probe` holds
    pub fn not_if(
        mut self,
        description: impl Into<String>,
        probe: impl Fn(&E) -> anyhow::Result<bool> + 'static,
    ) -> Self {
        self.not_if.push(Guard::new(description, probe));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Record failures and continue the pass
    pub fn ignore_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    /// Reboot immediately after a successful run
    pub fn reboot_now(mut self) -> Self {
        self.reboot = Some(RebootTiming::Immediate);
        self
    }

    /// Reboot at the next checkpoint after a successful run
    pub fn reboot_deferred(mut self) -> Self {
        self.reboot = Some(RebootTiming::Deferred);
        self
    }

    /// Fail the pass when a guard probe errors instead of running the step
    pub fn probe_failures_fatal(mut self) -> Self {
        self.probe_failures_fatal = true;
        self
    }

    /// Message reported when retries run out
    pub fn on_exhaustion(mut self, message: impl Into<String>) -> Self {
        self.exhaustion_message = Some(message.into());
        self
    }

    /// Wait this long after the action succeeds, before the next step
    pub fn settle_after(mut self, delay: Duration) -> Self {
        self.settle = (!delay.is_zero()).then_some(delay);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> &StepKind<E> {
        &self.kind
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self.kind, StepKind::RebootCheckpoint)
    }

    pub fn only_if_guards(&self) -> &[Guard<E>] {
        &self.only_if
    }

    pub fn not_if_guards(&self) -> &[Guard<E>] {
        &self.not_if
    }

    pub fn reboot(&self) -> Option<RebootTiming> {
        self.reboot
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn ignores_failure(&self) -> bool {
        self.ignore_failure
    }

    pub fn probe_failures_are_fatal(&self) -> bool {
        self.probe_failures_fatal
    }

    pub fn exhaustion_message(&self) -> Option<&str> {
        self.exhaustion_message.as_deref()
    }

    pub fn settle_delay(&self) -> Option<Duration> {
        self.settle
    }
}

impl<E> fmt::Debug for Step<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("checkpoint", &self.is_checkpoint())
            .field("only_if", &self.only_if)
            .field("not_if", &self.not_if)
            .field("reboot", &self.reboot)
            .field("retry", &self.retry)
            .field("ignore_failure", &self.ignore_failure)
            .field("settle", &self.settle)
            .finish_non_exhaustive()
    }
}
