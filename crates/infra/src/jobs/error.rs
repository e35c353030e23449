//! Job queue and scheduler error types

use std::time::Duration;

use stack_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use stack_common::{impl_error_classification, impl_error_conversion};
use thiserror::Error;

/// Queue-level failures
#[derive(Debug, Error)]
pub enum JobQueueError {
    /// The job cannot be stored as given
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Serialization, backend and persistence failures
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl_error_conversion!(JobQueueError, Common);
impl_error_classification!(JobQueueError, Common,
    Self::InvalidJob(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    }
);

/// Convenience type alias for queue operations
pub type JobQueueResult<T> = Result<T, JobQueueError>;

/// Lifecycle errors of the worker pool and the recurring scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Scheduler is already running
    #[error("Scheduler already running")]
    AlreadyRunning,

    /// Scheduler is not running
    #[error("Scheduler not running")]
    NotRunning,

    /// Rejected worker or schedule settings
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfiguration(String),

    /// Failed to create scheduler
    #[error("Failed to create scheduler: {0}")]
    CreationFailed(String),

    /// Failed to start scheduler
    #[error("Failed to start scheduler: {0}")]
    StartFailed(String),

    /// Failed to stop scheduler
    #[error("Failed to stop scheduler: {0}")]
    StopFailed(String),

    /// Failed to register job
    #[error("Failed to register job: {0}")]
    JobRegistrationFailed(String),

    /// Operation timed out
    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Task join failed
    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

impl SchedulerError {
    pub(crate) const fn timeout(duration: Duration) -> Self {
        Self::Timeout { seconds: duration.as_secs() }
    }
}

impl ErrorClassification for SchedulerError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::StartFailed(_))
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::AlreadyRunning | Self::NotRunning => ErrorSeverity::Warning,
            Self::TaskJoinFailed(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::TaskJoinFailed(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl From<SchedulerError> for CommonError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidConfiguration(message) => Self::config(message),
            SchedulerError::Timeout { seconds } => {
                Self::timeout("scheduler", Duration::from_secs(seconds))
            }
            other => Self::internal_with_context(other.to_string(), "scheduler"),
        }
    }
}

/// Convenience type alias for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_errors_delegate_to_common() {
        let err = JobQueueError::from(CommonError::backend("redis", "connection reset", true));
        assert!(err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Error);

        let err = JobQueueError::InvalidJob("missing type".into());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("missing type"));
    }

    #[test]
    fn serde_failures_become_serialization_errors() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{oops");
        let err = JobQueueError::from(parse.expect_err("invalid json"));
        assert!(matches!(err, JobQueueError::Common(CommonError::Serialization { .. })));
    }

    #[test]
    fn scheduler_errors_map_into_common() {
        let common = CommonError::from(SchedulerError::timeout(Duration::from_secs(5)));
        assert!(matches!(common, CommonError::Timeout { .. }));
        assert!(common.is_retryable());

        let common = CommonError::from(SchedulerError::NotRunning);
        assert!(matches!(common, CommonError::Internal { .. }));
        assert!(SchedulerError::TaskJoinFailed("panicked".into()).is_critical());
    }
}
