//! Step executor - runs a due step's action with its retry policy

use crate::context::{Clock, ProgressCallback};
use crate::error::StepError;
use crate::retry::with_retry;
use crate::step::{RebootTiming, Step, StepKind};
use crate::types::{ActionResult, ErrorClass, StepOutcome};
use std::time::Duration;

/// Outcome of a step plus the number of attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: StepOutcome,
    pub attempts: u32,
}

/// Execute a step whose guards said it is due.
///
/// Transient errors are retried per the step's policy. Running out of
/// attempts escalates the failure to [`ErrorClass::Fatal`], unless the step
/// ignores failures, in which case every failure is
/// [`ErrorClass::NonFatalStepFailure`].
pub fn execute<E>(
    step: &Step<E>,
    env: &E,
    clock: &dyn Clock,
    progress: &mut dyn ProgressCallback,
) -> Execution {
    let StepKind::Action(action) = step.kind() else {
        return Execution {
            outcome: StepOutcome::Success,
            attempts: 0,
        };
    };

    let mut on_retry = |attempt: u32, max_attempts: u32, error: &StepError, delay: Duration| {
        log::warn!(
            "'{}' attempt {}/{} failed: {}. Retrying in {}s",
            step.id(),
            attempt,
            max_attempts,
            error,
            delay.as_secs()
        );
        progress.on_retry(step.id(), attempt, max_attempts, error, delay);
    };

    let attempted = with_retry(step.retry_policy(), clock, &mut on_retry, || action(env));

    let outcome = match attempted.result {
        Ok(ActionResult::RebootRequired) => StepOutcome::RebootRequired,
        Ok(ActionResult::Done) if step.reboot() == Some(RebootTiming::Immediate) => {
            StepOutcome::RebootRequired
        }
        Ok(ActionResult::Done) => {
            if let Some(delay) = step.settle_delay() {
                log::info!("'{}' settling for {}s", step.id(), delay.as_secs());
                clock.sleep(delay);
            }
            StepOutcome::Success
        }
        Err(error) => {
            let reason = if attempted.exhausted {
                format!(
                    "{} after {} attempts: {}",
                    step.exhaustion_message().unwrap_or("gave up"),
                    attempted.attempts,
                    error
                )
            } else {
                error.to_string()
            };
            let class = if step.ignores_failure() {
                ErrorClass::NonFatalStepFailure
            } else if attempted.exhausted {
                ErrorClass::Fatal
            } else {
                error.class()
            };
            StepOutcome::Failed { reason, class }
        }
    };

    Execution {
        outcome,
        attempts: attempted.attempts,
    }
}
