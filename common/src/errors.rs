// Error handling framework
//
// Only registration-time errors are returned to the caller. Everything raised
// while a tick is running is isolated per task and surfaces through events.

use thiserror::Error;

/// Schedule-related errors, raised when a task is defined or registered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid frequency expression '{expression}': {reason}")]
    InvalidFrequencyExpression { expression: String, reason: String },

    #[error("Invalid time of day '{0}': expected H:MM or HH:MM")]
    InvalidTimeOfDay(String),

    #[error("Task '{0}' is already registered")]
    DuplicateFrequencyConflict(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task definition: {0}")]
    InvalidDefinition(String),
}

impl ScheduleError {
    pub(crate) fn invalid_expression(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        ScheduleError::InvalidFrequencyExpression {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}

/// Overlap lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock store unavailable: {0}")]
    LockStoreUnavailable(String),
}

/// Per-run dispatch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Hook failed for task '{task}': {reason}")]
    HookFailure { task: String, reason: String },

    #[error("Action failed for task '{task}': {reason}")]
    ActionFailure { task: String, reason: String },
}

/// Output routing errors
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write output file {path}: {reason}")]
    FileWriteFailed { path: String, reason: String },

    #[error("Failed to send mail: {0}")]
    MailFailed(String),
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl From<StorageError> for LockError {
    fn from(err: StorageError) -> Self {
        LockError::LockStoreUnavailable(err.to_string())
    }
}
