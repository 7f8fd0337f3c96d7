//! Error taxonomy shared by every Taskline crate.

use thiserror::Error;

/// Result type used across Taskline.
pub type Result<T> = std::result::Result<T, TasklineError>;

/// A step-level failure captured during one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Name of the step that failed.
    pub step: String,
    /// Rendered error message.
    pub error: String,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step '{}': {}", self.step, self.error)
    }
}

/// Taskline error.
///
/// Item-level failures never show up here: they are encoded into the
/// work-item status and committed. Everything below is either fatal for the
/// run (configuration) or a step/run-level failure that the runner logs
/// before moving on to the next tick.
#[derive(Debug, Error)]
pub enum TasklineError {
    /// Settings are missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A configured step name has no match in the step catalog.
    #[error("step '{0}' was not found in the step catalog")]
    StepNotFound(String),

    /// A queued step has no registered handler.
    #[error("step '{0}' is not implemented")]
    StepNotImplemented(String),

    /// Reading work-items for a step failed.
    #[error("failed to fetch work-items for step '{step}': {message}")]
    Fetch { step: String, message: String },

    /// Writing a step's batch failed.
    #[error("failed to commit work-items for step '{step}': {message}")]
    Commit { step: String, message: String },

    /// Persistence collaborator failure outside fetch/commit.
    #[error("storage error: {0}")]
    Storage(String),

    /// The cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// One or more steps of a run failed; reported once per run.
    #[error("task '{task}' finished with {} failed step(s): {}", .failures.len(), join_failures(.failures))]
    Pipeline {
        task: String,
        failures: Vec<StepFailure>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn join_failures(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl TasklineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Configuration errors stop the task instead of being retried next tick.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::StepNotFound(_) | Self::StepNotImplemented(_) | Self::Toml(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Step failures carried by an aggregated pipeline error.
    pub fn failures(&self) -> &[StepFailure] {
        match self {
            Self::Pipeline { failures, .. } => failures,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(TasklineError::StepNotFound("Load".into()).is_configuration());
        assert!(TasklineError::StepNotImplemented("Load".into()).is_configuration());
        assert!(TasklineError::config("bad").is_configuration());
        assert!(!TasklineError::Cancelled.is_configuration());
        assert!(
            !TasklineError::Fetch {
                step: "A".into(),
                message: "down".into()
            }
            .is_configuration()
        );
    }

    #[test]
    fn test_pipeline_error_message() {
        let err = TasklineError::Pipeline {
            task: "etl".into(),
            failures: vec![StepFailure {
                step: "Load".into(),
                error: "disk full".into(),
            }],
        };
        assert_eq!(err.failures().len(), 1);
        assert_eq!(
            err.to_string(),
            "task 'etl' finished with 1 failed step(s): step 'Load': disk full"
        );
    }

    #[test]
    fn test_not_implemented_message() {
        let err = TasklineError::StepNotImplemented("Transform".into());
        assert_eq!(err.to_string(), "step 'Transform' is not implemented");
    }
}
