//! Task processing status and result types.

use thiserror::Error;

/// Result of processing a single staged task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Task completed successfully
    Success,
    /// Task failed due to invalid input
    InvalidEntry,
    /// Task failed (generic)
    Failed,
    /// Task should be retried later
    NeedRetry,
    /// Task was ignored (duplicate, stale, etc.)
    Ignore,
    /// Task is waiting for a dependency to resolve
    WaitingForDependency,
}

impl TaskStatus {
    /// Returns true if the task completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    /// Returns true if the task should be re-queued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry | TaskStatus::WaitingForDependency)
    }

    /// Returns true if the task failed permanently.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::InvalidEntry | TaskStatus::Failed)
    }
}

/// Error type for task processing failures.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Task failed due to invalid entry data
    #[error("Invalid entry: {message}")]
    InvalidEntry { message: String },

    /// Task failed writing to the kernel table
    #[error("Kernel error: {message}")]
    KernelError { message: String },

    /// Task should be retried later
    #[error("Retry needed: {reason}")]
    NeedRetry { reason: String },

    /// Task is waiting for a dependency
    #[error("Waiting for dependency: {dependency}")]
    WaitingForDependency { dependency: String },

    /// Task was ignored
    #[error("Ignored: {reason}")]
    Ignored { reason: String },
}

impl TaskError {
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        TaskError::InvalidEntry {
            message: message.into(),
        }
    }

    pub fn kernel_error(message: impl Into<String>) -> Self {
        TaskError::KernelError {
            message: message.into(),
        }
    }

    pub fn need_retry(reason: impl Into<String>) -> Self {
        TaskError::NeedRetry {
            reason: reason.into(),
        }
    }

    pub fn waiting_for(dependency: impl Into<String>) -> Self {
        TaskError::WaitingForDependency {
            dependency: dependency.into(),
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        TaskError::Ignored {
            reason: reason.into(),
        }
    }

    /// Converts this error to a TaskStatus.
    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::InvalidEntry { .. } => TaskStatus::InvalidEntry,
            TaskError::KernelError { .. } => TaskStatus::Failed,
            TaskError::NeedRetry { .. } => TaskStatus::NeedRetry,
            TaskError::WaitingForDependency { .. } => TaskStatus::WaitingForDependency,
            TaskError::Ignored { .. } => TaskStatus::Ignore,
        }
    }
}

/// Result type for task processing.
pub type TaskResult<T> = Result<T, TaskError>;

/// Extension trait for converting TaskResult to TaskStatus.
pub trait TaskResultExt {
    fn to_status(&self) -> TaskStatus;
}

impl<T> TaskResultExt for TaskResult<T> {
    fn to_status(&self) -> TaskStatus {
        match self {
            Ok(_) => TaskStatus::Success,
            Err(e) => e.to_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_classification() {
        assert!(TaskStatus::Success.is_success());
        assert!(TaskStatus::Ignore.is_success());
        assert!(!TaskStatus::Failed.is_success());

        assert!(TaskStatus::NeedRetry.is_retryable());
        assert!(TaskStatus::WaitingForDependency.is_retryable());
        assert!(!TaskStatus::Success.is_retryable());

        assert!(TaskStatus::Failed.is_failure());
        assert!(TaskStatus::InvalidEntry.is_failure());
        assert!(!TaskStatus::WaitingForDependency.is_failure());
    }

    #[test]
    fn test_error_to_status() {
        assert_eq!(
            TaskError::waiting_for("nexthop vm-3").to_status(),
            TaskStatus::WaitingForDependency
        );
        assert_eq!(
            TaskError::kernel_error("table full").to_status(),
            TaskStatus::Failed
        );
    }

    #[test]
    fn test_result_ext() {
        let ok: TaskResult<()> = Ok(());
        assert_eq!(ok.to_status(), TaskStatus::Success);

        let err: TaskResult<()> = Err(TaskError::need_retry("kernel write failed"));
        assert_eq!(err.to_status(), TaskStatus::NeedRetry);
    }
}
