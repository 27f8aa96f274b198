//! Guard evaluation - decides whether a step is due

use crate::error::{Error, Result};
use crate::step::{Guard, Step};
use crate::types::{GuardOutcome, SkipReason};

/// Whether a step should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip(SkipReason),
}

/// Evaluate a step's guards against the environment.
///
/// `not_if` guards are checked first: if any holds, the step is skipped as
/// already satisfied regardless of its `only_if` guards. Otherwise any
/// `only_if` guard that does not hold skips the step as precondition not
/// met. A probe error counts toward running the step unless the step
/// treats probe failures as fatal.
pub fn evaluate<E>(step: &Step<E>, env: &E) -> Result<Decision> {
    for guard in step.not_if_guards() {
        match guard.evaluate(env) {
            GuardOutcome::Satisfied => {
                log::info!(
                    "Skipping '{}': already satisfied ({})",
                    step.id(),
                    guard.description()
                );
                return Ok(Decision::Skip(SkipReason::AlreadySatisfied));
            }
            GuardOutcome::Unsatisfied => {}
            GuardOutcome::ProbeError(message) => probe_failed(step, guard, message)?,
        }
    }

    for guard in step.only_if_guards() {
        match guard.evaluate(env) {
            GuardOutcome::Satisfied => {}
            GuardOutcome::Unsatisfied => {
                log::info!(
                    "Skipping '{}': precondition not met ({})",
                    step.id(),
                    guard.description()
                );
                return Ok(Decision::Skip(SkipReason::PreconditionNotMet));
            }
            GuardOutcome::ProbeError(message) => probe_failed(step, guard, message)?,
        }
    }

    Ok(Decision::Run)
}

fn probe_failed<E>(step: &Step<E>, guard: &Guard<E>, message: String) -> Result<()> {
    if step.probe_failures_are_fatal() {
        return Err(Error::ProbeFailed {
            step: step.id().to_string(),
            guard: guard.description().to_string(),
            message,
        });
    }
    log::warn!(
        "Guard '{}' of '{}' could not be evaluated ({}); running the step",
        guard.description(),
        step.id(),
        message
    );
    Ok(())
}
