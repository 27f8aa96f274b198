//! Convergence driver - runs one pass of a pipeline
//!
//! A pass takes the lock, loads the persisted state, resumes after the last
//! completed step and walks the remaining steps through the guard evaluator
//! and the executor. It ends when the pipeline is exhausted, a step asks for
//! a reboot, or a step fails fatally.

use crate::context::{Clock, ProgressCallback};
use crate::error::{Error, Result};
use crate::executor::execute;
use crate::guard::{Decision, evaluate};
use crate::lock::{LockInfo, PassLock};
use crate::pipeline::Pipeline;
use crate::reboot::{RebootCoordinator, RebootPlatform};
use crate::state::{ConvergenceState, StateStore};
use crate::step::{RebootTiming, Step};
use crate::types::{ErrorClass, PassOutcome, PassSummary, SkipReason, StepOutcome, StepReport};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;

/// Options for a pass
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Evaluate guards only; no lock, no actions, no state writes
    pub dry_run: bool,
    /// Issue OS reboots when requested
    pub allow_reboot: bool,
    /// Lock file guarding against concurrent passes
    pub lock_path: PathBuf,
    /// Age after which an existing lock is considered abandoned
    pub stale_lock_after: Duration,
}

impl DriverOptions {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            dry_run: false,
            allow_reboot: true,
            lock_path: lock_path.into(),
            stale_lock_after: Duration::from_secs(6 * 3600),
        }
    }
}

/// Runs a pipeline against an environment
pub struct Driver<'a, E> {
    pipeline: &'a Pipeline<E>,
    env: &'a E,
    store: &'a dyn StateStore,
    reboot: &'a dyn RebootPlatform,
    clock: &'a dyn Clock,
    options: DriverOptions,
}

impl<'a, E> Driver<'a, E> {
    pub fn new(
        pipeline: &'a Pipeline<E>,
        env: &'a E,
        store: &'a dyn StateStore,
        reboot: &'a dyn RebootPlatform,
        clock: &'a dyn Clock,
        options: DriverOptions,
    ) -> Self {
        Self {
            pipeline,
            env,
            store,
            reboot,
            clock,
            options,
        }
    }

    /// Run one pass
    pub fn run(&self, progress: &mut dyn ProgressCallback) -> Result<PassOutcome> {
        if self.options.dry_run {
            return self.plan(progress);
        }

        let holder_alive = |holder: &LockInfo| self.reboot.holder_alive(holder);
        let Some(lock) = PassLock::try_acquire(
            &self.options.lock_path,
            self.options.stale_lock_after,
            &holder_alive,
        )?
        else {
            log::info!(
                "Another pass holds {}; exiting",
                self.options.lock_path.display()
            );
            return Ok(PassOutcome::Busy);
        };

        let mut coordinator = RebootCoordinator::new(self.reboot, self.options.allow_reboot);
        let outcome = self.converge(&mut coordinator, progress)?;

        // The lock must not survive into the next boot
        drop(lock);

        if matches!(outcome, PassOutcome::RebootPending { .. }) {
            coordinator.issue()?;
        }
        Ok(outcome)
    }

    fn converge(
        &self,
        coordinator: &mut RebootCoordinator<'_>,
        progress: &mut dyn ProgressCallback,
    ) -> Result<PassOutcome> {
        let mut state = self.load_state()?;
        coordinator.resume(&mut state);

        if let Err(e) = coordinator.ensure_reentry() {
            log::warn!("{e}");
        }

        let start = self.resume_index(&state);
        let steps = self.pipeline.steps();
        progress.on_pass_start(self.pipeline.name(), steps.len(), start);

        let mut summary = PassSummary::default();

        for (index, step) in steps.iter().enumerate() {
            if index < start {
                record(
                    &mut summary,
                    progress,
                    step,
                    StepReport::Skipped {
                        reason: SkipReason::CompletedEarlier,
                    },
                );
                continue;
            }

            progress.on_step_start(index, step.id(), step.description());

            if step.is_checkpoint() {
                state.mark_completed(step.id());
                if let Some(requested_by) = state.deferred_reboot.take() {
                    log::info!(
                        "Checkpoint '{}' honoring reboot deferred by '{}'",
                        step.id(),
                        requested_by
                    );
                    record(
                        &mut summary,
                        progress,
                        step,
                        StepReport::RebootRequested { attempts: 0 },
                    );
                    coordinator.request(&mut state, self.store, &requested_by)?;
                    return Ok(PassOutcome::RebootPending {
                        step: step.id().to_string(),
                        summary,
                    });
                }
                self.save(&mut state)?;
                record(
                    &mut summary,
                    progress,
                    step,
                    StepReport::Skipped {
                        reason: SkipReason::PreconditionNotMet,
                    },
                );
                continue;
            }

            if let Decision::Skip(reason) = evaluate(step, self.env)? {
                state.mark_completed(step.id());
                self.save(&mut state)?;
                record(&mut summary, progress, step, StepReport::Skipped { reason });
                continue;
            }

            log::info!("Running '{}': {}", step.id(), step.description());
            let execution = execute(step, self.env, self.clock, progress);
            state.record_attempts(step.id(), execution.attempts);
            let attempts = execution.attempts;

            match execution.outcome {
                StepOutcome::Success => {
                    state.mark_completed(step.id());
                    if step.reboot() == Some(RebootTiming::Deferred)
                        && state.deferred_reboot.is_none()
                    {
                        state.deferred_reboot = Some(step.id().to_string());
                    }
                    self.save(&mut state)?;
                    record(&mut summary, progress, step, StepReport::Applied { attempts });
                }
                StepOutcome::RebootRequired => {
                    state.mark_completed(step.id());
                    record(
                        &mut summary,
                        progress,
                        step,
                        StepReport::RebootRequested { attempts },
                    );
                    coordinator.request(&mut state, self.store, step.id())?;
                    return Ok(PassOutcome::RebootPending {
                        step: step.id().to_string(),
                        summary,
                    });
                }
                StepOutcome::Failed {
                    reason,
                    class: ErrorClass::NonFatalStepFailure,
                } => {
                    log::warn!("'{}' failed, continuing: {}", step.id(), reason);
                    state.record_failure(step.id(), &reason);
                    state.mark_completed(step.id());
                    self.save(&mut state)?;
                    record(
                        &mut summary,
                        progress,
                        step,
                        StepReport::Failed { reason, attempts },
                    );
                }
                StepOutcome::Failed { reason, class } => {
                    self.save(&mut state)?;
                    return Err(Error::StepFailed {
                        step: step.id().to_string(),
                        class,
                        message: reason,
                    });
                }
            }
        }

        if let Some(requested_by) = state.deferred_reboot.clone() {
            coordinator.request(&mut state, self.store, &requested_by)?;
            return Ok(PassOutcome::RebootPending {
                step: requested_by,
                summary,
            });
        }

        state.completed_at = Some(Utc::now());
        state.touch();
        self.store.archive(&state)?;
        log::info!("Pipeline '{}' converged", self.pipeline.name());
        Ok(PassOutcome::Completed(summary))
    }

    /// Dry run: report what a pass would do without doing it
    fn plan(&self, progress: &mut dyn ProgressCallback) -> Result<PassOutcome> {
        let state = self.load_state()?;
        let start = self.resume_index(&state);
        let steps = self.pipeline.steps();
        progress.on_pass_start(self.pipeline.name(), steps.len(), start);

        let mut summary = PassSummary::default();
        for (index, step) in steps.iter().enumerate() {
            let report = if index < start {
                StepReport::Skipped {
                    reason: SkipReason::CompletedEarlier,
                }
            } else if step.is_checkpoint() {
                if state.deferred_reboot.is_some() {
                    StepReport::WouldApply
                } else {
                    StepReport::Skipped {
                        reason: SkipReason::PreconditionNotMet,
                    }
                }
            } else {
                match evaluate(step, self.env)? {
                    Decision::Run => StepReport::WouldApply,
                    Decision::Skip(reason) => StepReport::Skipped { reason },
                }
            };
            record(&mut summary, progress, step, report);
        }

        Ok(PassOutcome::Completed(summary))
    }

    fn load_state(&self) -> Result<ConvergenceState> {
        let role = self.pipeline.name();
        match self.store.load()? {
            Some(state) => {
                if let Some(recorded) = &state.role
                    && recorded != role
                {
                    return Err(Error::Configuration {
                        message: format!(
                            "state was recorded for role '{recorded}' but this pass runs '{role}'; reset the state to start over"
                        ),
                    });
                }
                Ok(state)
            }
            None => Ok(ConvergenceState::new(role)),
        }
    }

    fn resume_index(&self, state: &ConvergenceState) -> usize {
        let Some(last) = &state.last_completed_step else {
            return 0;
        };
        match self.pipeline.position(last) {
            Some(index) => index + 1,
            None => {
                log::warn!(
                    "Last completed step '{last}' is not part of pipeline '{}'; starting from the beginning",
                    self.pipeline.name()
                );
                0
            }
        }
    }

    fn save(&self, state: &mut ConvergenceState) -> Result<()> {
        state.touch();
        self.store.save(state)
    }
}

fn record<E>(
    summary: &mut PassSummary,
    progress: &mut dyn ProgressCallback,
    step: &Step<E>,
    report: StepReport,
) {
    progress.on_step_complete(step.id(), &report);
    summary.push(step.id(), step.description(), report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, NoProgress};
    use crate::error::StepError;
    use crate::pipeline::PipelineBuilder;
    use crate::retry::RetryPolicy;
    use crate::state::MemoryStateStore;
    use crate::testing::{FactEnv, RecordingReboot};
    use crate::types::ActionResult;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// A step that sets `id` as a fact and is skipped once the fact holds
    fn converging(id: &'static str) -> Step<FactEnv> {
        Step::new(id, format!("converge {id}"), move |env: &FactEnv| {
            env.act(id);
            env.set(id);
            Ok(ActionResult::Done)
        })
        .not_if(format!("{id} present"), move |env: &FactEnv| Ok(env.has(id)))
    }

    fn pipeline(steps: Vec<Step<FactEnv>>) -> Pipeline<FactEnv> {
        let mut builder = PipelineBuilder::new("head-node");
        builder.steps(steps);
        builder.build().unwrap()
    }

    struct Harness {
        _dir: TempDir,
        options: DriverOptions,
        store: MemoryStateStore,
        reboot: RecordingReboot,
        clock: ManualClock,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let options = DriverOptions::new(dir.path().join("hpcnode.lock"));
            Self {
                _dir: dir,
                options,
                store: MemoryStateStore::new(),
                reboot: RecordingReboot::default(),
                clock: ManualClock::new(),
            }
        }

        fn run(&self, pipeline: &Pipeline<FactEnv>, env: &FactEnv) -> Result<PassOutcome> {
            Driver::new(
                pipeline,
                env,
                &self.store,
                &self.reboot,
                &self.clock,
                self.options.clone(),
            )
            .run(&mut NoProgress)
        }
    }

    #[test]
    fn test_second_pass_performs_no_actions() {
        let h = Harness::new();
        let env = FactEnv::default();
        let p = pipeline(vec![converging("a"), converging("b"), converging("c")]);

        let first = h.run(&p, &env).unwrap();
        assert_eq!(first.summary().unwrap().applied(), 3);
        assert_eq!(env.actions(), vec!["a", "b", "c"]);
        assert!(h.store.load().unwrap().is_none());
        assert!(h.store.load_completed().unwrap().unwrap().completed_at.is_some());

        env.clear_actions();
        let second = h.run(&p, &env).unwrap();
        let summary = second.summary().unwrap();
        assert_eq!(summary.actions(), 0);
        assert_eq!(summary.skipped(), 3);
        assert!(env.actions().is_empty());
    }

    #[test]
    fn test_resume_after_reboot_starts_at_next_step() {
        let h = Harness::new();
        let env = FactEnv::default();
        let join = Step::new("join", "join domain", |env: &FactEnv| {
            env.act("join");
            Ok(ActionResult::RebootRequired)
        });
        let p = pipeline(vec![converging("a"), join, converging("c")]);

        let first = h.run(&p, &env).unwrap();
        assert!(matches!(first, PassOutcome::RebootPending { ref step, .. } if step == "join"));
        assert_eq!(h.reboot.reboots(), 1);
        assert_eq!(env.actions(), vec!["a", "join"]);

        let saved = h.store.load().unwrap().unwrap();
        assert!(saved.pending_reboot);
        assert_eq!(saved.last_completed_step.as_deref(), Some("join"));

        // A fresh driver over the same store is the re-entry after boot
        env.clear_actions();
        let second = h.run(&p, &env).unwrap();
        assert!(matches!(second, PassOutcome::Completed(_)));
        assert_eq!(env.actions(), vec!["c"]);
        let summary = second.summary().unwrap();
        assert_eq!(
            summary.report("join"),
            Some(&StepReport::Skipped {
                reason: SkipReason::CompletedEarlier
            })
        );
    }

    #[test]
    fn test_deferred_reboot_fires_at_checkpoint() {
        let h = Harness::new();
        let env = FactEnv::default();
        let p = pipeline(vec![
            converging("uninstall").reboot_deferred(),
            converging("other"),
            Step::reboot_checkpoint("checkpoint", "reboot if needed"),
            converging("after"),
        ]);

        let first = h.run(&p, &env).unwrap();
        assert!(
            matches!(first, PassOutcome::RebootPending { ref step, .. } if step == "checkpoint")
        );
        assert_eq!(env.actions(), vec!["uninstall", "other"]);

        env.clear_actions();
        let second = h.run(&p, &env).unwrap();
        assert!(matches!(second, PassOutcome::Completed(_)));
        assert_eq!(env.actions(), vec!["after"]);
        assert_eq!(h.reboot.reboots(), 1);
    }

    #[test]
    fn test_deferred_reboot_without_checkpoint_fires_at_end() {
        let h = Harness::new();
        let env = FactEnv::default();
        let p = pipeline(vec![converging("a").reboot_deferred(), converging("b")]);

        let first = h.run(&p, &env).unwrap();
        assert!(matches!(first, PassOutcome::RebootPending { ref step, .. } if step == "a"));

        let second = h.run(&p, &env).unwrap();
        assert!(matches!(second, PassOutcome::Completed(_)));
        assert!(h.store.load_completed().unwrap().is_some());
    }

    #[test]
    fn test_fatal_failure_stops_pass_and_keeps_progress() {
        let h = Harness::new();
        let env = FactEnv::default();
        let fail = Step::new("install", "install role", |_: &FactEnv| {
            Err(StepError::permanent("installer exited with 2"))
        });
        let p = pipeline(vec![converging("a"), fail, converging("c")]);

        let err = h.run(&p, &env).unwrap_err();
        assert!(matches!(
            err,
            Error::StepFailed { ref step, class: ErrorClass::Fatal, .. } if step == "install"
        ));
        assert!(!env.has("c"));
        let saved = h.store.load().unwrap().unwrap();
        assert_eq!(saved.last_completed_step.as_deref(), Some("a"));
        assert_eq!(saved.attempts["install"], 1);
        // Lock released even on failure
        assert!(!h.options.lock_path.exists());
    }

    #[test]
    fn test_ignored_failure_does_not_affect_other_steps() {
        let h = Harness::new();
        let env = FactEnv::default();
        let flaky = Step::new("uninstall-kb", "uninstall update", |_: &FactEnv| {
            Err(StepError::permanent("wusa exited with 87"))
        })
        .ignore_failure();
        let p = pipeline(vec![converging("a"), flaky, converging("c")]);

        let outcome = h.run(&p, &env).unwrap();
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.applied(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(env.actions(), vec!["a", "c"]);
        let completed = h.store.load_completed().unwrap().unwrap();
        assert!(completed.failures["uninstall-kb"].contains("87"));
    }

    #[test]
    fn test_retry_ceiling_exact_invocations() {
        let h = Harness::new();
        let env = FactEnv::default();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let poll = Step::new("wait-registered", "wait for node", move |_: &FactEnv| {
            counter.set(counter.get() + 1);
            Err(StepError::transient("node not found"))
        })
        .retry(RetryPolicy::fixed(5, Duration::from_secs(10)));
        let p = pipeline(vec![poll]);

        let err = h.run(&p, &env).unwrap_err();
        assert_eq!(calls.get(), 5);
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(h.clock.sleeps().len(), 4);
    }

    #[test]
    fn test_busy_when_lock_held() {
        let h = Harness::new();
        let env = FactEnv::default();
        let p = pipeline(vec![converging("a")]);
        let _held =
            PassLock::try_acquire(&h.options.lock_path, Duration::from_secs(3600), &|_| true)
                .unwrap()
                .unwrap();

        let outcome = h.run(&p, &env).unwrap();
        assert!(matches!(outcome, PassOutcome::Busy));
        assert!(env.actions().is_empty());
    }

    #[test]
    fn test_role_mismatch_is_configuration_error() {
        let h = Harness::new();
        let env = FactEnv::default();
        h.store
            .save(&ConvergenceState::new("compute-node"))
            .unwrap();
        let p = pipeline(vec![converging("a")]);

        let err = h.run(&p, &env).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(env.actions().is_empty());
    }

    #[test]
    fn test_unknown_last_step_restarts_from_beginning() {
        let h = Harness::new();
        let env = FactEnv::default();
        let mut state = ConvergenceState::new("head-node");
        state.mark_completed("removed-step");
        h.store.save(&state).unwrap();
        let p = pipeline(vec![converging("a")]);

        h.run(&p, &env).unwrap();
        assert_eq!(env.actions(), vec!["a"]);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let mut h = Harness::new();
        h.options.dry_run = true;
        let env = FactEnv::default();
        env.set("b");
        let p = pipeline(vec![converging("a"), converging("b")]);

        let outcome = h.run(&p, &env).unwrap();
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.report("a"), Some(&StepReport::WouldApply));
        assert_eq!(
            summary.report("b"),
            Some(&StepReport::Skipped {
                reason: SkipReason::AlreadySatisfied
            })
        );
        assert!(env.actions().is_empty());
        assert_eq!(h.store.saves(), 0);
        assert_eq!(h.reboot.reentry_calls(), 0);
    }

    #[test]
    fn test_reentry_failure_at_pass_start_is_warning() {
        let mut h = Harness::new();
        h.reboot = RecordingReboot::failing_reentry();
        let env = FactEnv::default();
        let p = pipeline(vec![converging("a")]);

        let outcome = h.run(&p, &env).unwrap();
        assert!(matches!(outcome, PassOutcome::Completed(_)));
    }

    #[test]
    fn test_lock_left_by_reboot_does_not_block_reentry() {
        let mut h = Harness::new();
        h.reboot = RecordingReboot::with_dead_holders();
        let env = FactEnv::default();
        let p = pipeline(vec![converging("a"), converging("b")]);

        let mut state = ConvergenceState::new("head-node");
        state.mark_completed("a");
        state.pending_reboot = true;
        h.store.save(&state).unwrap();
        let leftover = LockInfo {
            pid: 4_000_000,
            acquired_at: Utc::now() - chrono::Duration::minutes(2),
        };
        std::fs::write(&h.options.lock_path, toml::to_string(&leftover).unwrap()).unwrap();

        let outcome = h.run(&p, &env).unwrap();
        assert!(matches!(outcome, PassOutcome::Completed(_)));
        assert_eq!(env.actions(), vec!["b"]);
        assert!(!h.options.lock_path.exists());
    }
}
