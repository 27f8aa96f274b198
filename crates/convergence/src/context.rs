//! Time and progress provider traits
//!
//! These traits let the engine run against the real clock and a terminal
//! UI in production, and against virtual time in tests.

use crate::error::StepError;
use crate::types::StepReport;
use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

/// Time source used by retry loops
pub trait Clock {
    /// Current instant
    fn now(&self) -> Instant;

    /// Block for the given duration
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instantly and is recorded
pub struct ManualClock {
    origin: Instant,
    elapsed: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
    }

    /// Total virtual time elapsed
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
        self.advance(duration);
    }
}

/// Progress callback for a convergence pass
///
/// Implement this trait to receive progress updates during a pass.
pub trait ProgressCallback {
    /// Called once before the first step
    fn on_pass_start(&mut self, pipeline: &str, total: usize, resume_at: usize);

    /// Called when a step is about to be evaluated
    fn on_step_start(&mut self, index: usize, id: &str, description: &str);

    /// Called before sleeping between attempts of a step
    fn on_retry(
        &mut self,
        id: &str,
        attempt: u32,
        max_attempts: u32,
        error: &StepError,
        delay: Duration,
    );

    /// Called when a step has a final report
    fn on_step_complete(&mut self, id: &str, report: &StepReport);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_pass_start(&mut self, _pipeline: &str, _total: usize, _resume_at: usize) {}
    fn on_step_start(&mut self, _index: usize, _id: &str, _description: &str) {}
    fn on_retry(&mut self, _: &str, _: u32, _: u32, _: &StepError, _: Duration) {}
    fn on_step_complete(&mut self, _id: &str, _report: &StepReport) {}
}
