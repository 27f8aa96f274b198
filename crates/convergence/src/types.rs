//! Core types for step evaluation and pass reporting

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of a single guard probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The probed condition holds
    Satisfied,
    /// The probed condition does not hold
    Unsatisfied,
    /// The probe itself could not run
    ProbeError(String),
}

impl GuardOutcome {
    /// Map a probe result onto a guard outcome
    pub fn from_probe(result: anyhow::Result<bool>) -> Self {
        match result {
            Ok(true) => Self::Satisfied,
            Ok(false) => Self::Unsatisfied,
            Err(e) => Self::ProbeError(format!("{e:#}")),
        }
    }
}

/// Why a step did not execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A `not_if` guard reported the post-condition already holds
    AlreadySatisfied,
    /// An `only_if` guard reported the precondition is missing
    PreconditionNotMet,
    /// The step completed in an earlier pass of the same run
    CompletedEarlier,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySatisfied => write!(f, "already satisfied"),
            Self::PreconditionNotMet => write!(f, "precondition not met"),
            Self::CompletedEarlier => write!(f, "completed earlier"),
        }
    }
}

/// What an action reports when it succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    /// The action converged its resource
    Done,
    /// The action converged its resource but the OS must restart
    RebootRequired,
}

/// Classification of a step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Required input is missing or invalid; fails before any action
    Configuration,
    /// A dependency is unavailable; retried per policy
    TransientUnavailable,
    /// The step failed but is marked as ignorable
    NonFatalStepFailure,
    /// The pass must stop
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::TransientUnavailable => write!(f, "transient"),
            Self::NonFatalStepFailure => write!(f, "non-fatal"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Outcome of executing a step that was due
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    RebootRequired,
    Failed { reason: String, class: ErrorClass },
}

/// Per-step entry in a pass report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepReport {
    /// Not executed
    Skipped { reason: SkipReason },
    /// Executed successfully
    Applied { attempts: u32 },
    /// Executed and asked for a reboot (or a checkpoint fired)
    RebootRequested { attempts: u32 },
    /// Executed, failed, and the failure was ignored
    Failed { reason: String, attempts: u32 },
    /// Dry run: the step is due
    WouldApply,
}

impl StepReport {
    /// Whether an action actually ran
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            Self::Applied { .. } | Self::RebootRequested { .. } | Self::Failed { .. }
        )
    }
}

/// A step's report together with its identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub id: String,
    pub description: String,
    #[serde(flatten)]
    pub report: StepReport,
}

/// Everything that happened during one pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    pub steps: Vec<StepRecord>,
}

impl PassSummary {
    /// Append a report
    pub fn push(&mut self, id: &str, description: &str, report: StepReport) {
        self.steps.push(StepRecord {
            id: id.to_string(),
            description: description.to_string(),
            report,
        });
    }

    /// Number of steps whose action ran
    pub fn actions(&self) -> usize {
        self.steps.iter().filter(|s| s.report.is_action()).count()
    }

    /// Number of steps applied successfully
    pub fn applied(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.report, StepReport::Applied { .. }))
            .count()
    }

    /// Number of skipped steps
    pub fn skipped(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.report, StepReport::Skipped { .. }))
            .count()
    }

    /// Number of ignored failures
    pub fn failed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.report, StepReport::Failed { .. }))
            .count()
    }

    /// Number of steps a dry run found due
    pub fn would_apply(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.report, StepReport::WouldApply))
            .count()
    }

    /// Look up the report for a step
    pub fn report(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.id == id).map(|s| &s.report)
    }
}

/// How a pass ended
#[derive(Debug, Clone)]
pub enum PassOutcome {
    /// The pipeline reached its end
    Completed(PassSummary),
    /// A reboot was requested; the next pass resumes after `step`
    RebootPending { step: String, summary: PassSummary },
    /// Another pass holds the lock; nothing was done
    Busy,
}

impl PassOutcome {
    /// The pass report, if the pass ran
    pub fn summary(&self) -> Option<&PassSummary> {
        match self {
            Self::Completed(summary) | Self::RebootPending { summary, .. } => Some(summary),
            Self::Busy => None,
        }
    }
}
