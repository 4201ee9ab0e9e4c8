use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("Invalid capture item: {0}")]
    Validation(String),

    #[error("An active job already owns the name '{0}'")]
    DuplicateName(String),

    #[error("Capture queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Artifact store failed: {0}")]
    Store(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Capture cancelled")]
    Cancelled,

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CaptureError {
    /// Failures that the worker retries while attempts remain.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::Render(_) | CaptureError::Store(_) | CaptureError::Timeout(_)
        )
    }

    /// How loudly a failure is logged. Rejections the caller caused and
    /// explicit cancels are `Low`.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::Validation(_) => ErrorSeverity::Low,
            CaptureError::DuplicateName(_) => ErrorSeverity::Low,
            CaptureError::Cancelled => ErrorSeverity::Low,
            CaptureError::QueueFull { .. } => ErrorSeverity::High,
            CaptureError::Config(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Config(err.to_string())
    }
}
