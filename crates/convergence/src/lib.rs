//! # Convergence
//!
//! An engine for idempotent, reboot-surviving bootstrap pipelines.
//!
//! A pass walks an ordered list of steps. Each step is guarded by probes
//! that decide whether its post-condition already holds; steps that are due
//! run with bounded retries. Progress is persisted after every step so a
//! pass interrupted by a reboot resumes at the next step.
//!
//! ## Core Concepts
//!
//! - **Step**: An action plus `only_if`/`not_if` guards, a retry policy and reboot flags
//! - **Guard**: A side-effect free probe returning [`GuardOutcome`]
//! - **Pipeline**: An ordered list of steps with a deferred tail
//! - **Driver**: Runs one pass, persisting [`ConvergenceState`] as it goes
//! - **RebootCoordinator**: Persists the resume point and hands off to the OS
//!
//! ## Example
//!
//! ```ignore
//! use convergence::{
//!     ActionResult, Driver, DriverOptions, FileStateStore, NoProgress, PipelineBuilder,
//!     RetryPolicy, Step, SystemClock,
//! };
//!
//! let mut builder = PipelineBuilder::new("demo");
//! builder.step(
//!     Step::new("write-marker", "Write the marker file", |env: &Env| {
//!         std::fs::write(&env.marker, "ok").map_err(anyhow::Error::from)?;
//!         Ok(ActionResult::Done)
//!     })
//!     .not_if("marker exists", |env: &Env| Ok(env.marker.exists()))
//!     .retry(RetryPolicy::fixed(3, std::time::Duration::from_secs(5))),
//! );
//! let pipeline = builder.build()?;
//!
//! let store = FileStateStore::new(state_dir);
//! let driver = Driver::new(&pipeline, &env, &store, &platform, &SystemClock, options);
//! let outcome = driver.run(&mut NoProgress)?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`StateStore`]: Where the convergence state lives between passes
//! - [`RebootPlatform`]: Registers the boot-time re-entry task and reboots
//! - [`Clock`]: Time source used for retry delays
//! - [`ProgressCallback`]: Receives progress updates

pub mod context;
pub mod driver;
pub mod error;
pub mod executor;
pub mod guard;
pub mod lock;
pub mod pipeline;
pub mod reboot;
pub mod retry;
pub mod state;
pub mod step;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use context::{Clock, ManualClock, NoProgress, ProgressCallback, SystemClock};
pub use driver::{Driver, DriverOptions};
pub use error::{Error, Result, StepError};
pub use executor::{Execution, execute};
pub use guard::{Decision, evaluate};
pub use lock::{LockInfo, PassLock, process_alive};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use reboot::{RebootCoordinator, RebootPhase, RebootPlatform};
pub use retry::{Attempted, Backoff, RetryPolicy, with_retry};
pub use state::{ConvergenceState, FileStateStore, MemoryStateStore, StateStore};
pub use step::{Guard, RebootTiming, Step, StepKind};
pub use types::{
    ActionResult, ErrorClass, GuardOutcome, PassOutcome, PassSummary, SkipReason, StepOutcome,
    StepRecord, StepReport,
};
