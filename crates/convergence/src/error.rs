//! Error types for the convergence engine.
//!
//! Step actions fail with a [`StepError`], which carries enough
//! classification for the executor to decide whether to retry. Everything
//! that ends a pass surfaces as an [`Error`].

use crate::types::ErrorClass;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a step action
#[derive(Debug, Error)]
pub enum StepError {
    /// Missing or invalid input; never retried
    #[error("{message}")]
    Configuration { message: String },

    /// A dependency is temporarily unavailable; retried per the step's policy
    #[error("{message}")]
    Transient { message: String },

    /// The action failed and retrying will not help
    #[error("{message}")]
    Permanent { message: String },
}

impl StepError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Whether the executor should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Error class reported when this error ends a step
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration { .. } => ErrorClass::Configuration,
            Self::Transient { .. } => ErrorClass::TransientUnavailable,
            Self::Permanent { .. } => ErrorClass::Fatal,
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::Permanent {
            message: format!("{err:#}"),
        }
    }
}

/// Errors that end a convergence pass
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration detected before or during the pass
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A step failed and the failure was not ignorable
    #[error("step '{step}' failed ({class}): {message}")]
    StepFailed {
        step: String,
        class: ErrorClass,
        message: String,
    },

    /// A guard probe failed on a step that treats probe failures as fatal
    #[error("guard '{guard}' of step '{step}' could not be evaluated: {message}")]
    ProbeFailed {
        step: String,
        guard: String,
        message: String,
    },

    /// The pipeline definition is malformed
    #[error("invalid pipeline '{pipeline}': {message}")]
    InvalidPipeline { pipeline: String, message: String },

    /// The state file could not be read or written
    #[error("state file {}: {message}", path.display())]
    State { path: PathBuf, message: String },

    /// The pass lock could not be created or inspected
    #[error("lock file {}: {message}", path.display())]
    Lock { path: PathBuf, message: String },

    /// Registering the re-entry task or issuing the reboot failed
    #[error("reboot coordination failed: {message}")]
    Reboot { message: String },
}

impl Error {
    /// Error class used for the process exit report
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration { .. } => ErrorClass::Configuration,
            Self::StepFailed { class, .. } => *class,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Result type alias for convergence operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(StepError::transient("share offline").is_retryable());
        assert!(!StepError::permanent("exit code 2").is_retryable());
        assert!(!StepError::configuration("missing domain").is_retryable());
    }

    #[test]
    fn test_step_error_class() {
        assert_eq!(
            StepError::configuration("x").class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            StepError::transient("x").class(),
            ErrorClass::TransientUnavailable
        );
        assert_eq!(StepError::permanent("x").class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_anyhow_maps_to_permanent_with_chain() {
        let err = anyhow::anyhow!("access denied").context("Failed to join domain");
        let step_err = StepError::from(err);
        assert!(matches!(step_err, StepError::Permanent { .. }));
        assert_eq!(step_err.to_string(), "Failed to join domain: access denied");
    }

    #[test]
    fn test_step_failed_display() {
        let err = Error::StepFailed {
            step: "join-domain".into(),
            class: ErrorClass::Fatal,
            message: "access denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "step 'join-domain' failed (fatal): access denied"
        );
        assert_eq!(err.class(), ErrorClass::Fatal);
    }
}
