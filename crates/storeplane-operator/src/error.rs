//! Error types for the storeplane operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration or spec
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Spec validation failed
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Status write lost the optimistic-concurrency race twice
    #[error("Status update conflict: {0}")]
    Conflict(String),

    /// Template renderer invocation failed
    #[error("Renderer error: {0}")]
    Renderer(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Timeout(_)
                | OperatorError::Conflict(_)
                | OperatorError::Renderer(_)
                | OperatorError::ReconcileFailed(_)
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(5))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::Renderer("release stuck".to_string());
        assert!(err.to_string().contains("release stuck"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(OperatorError::Timeout("t".into()).is_retryable());
        assert!(OperatorError::Conflict("c".into()).is_retryable());
        assert!(!OperatorError::ValidationError("v".into()).is_retryable());
        assert!(!OperatorError::InvalidConfig("i".into()).is_retryable());
    }

    #[test]
    fn test_requeue_delay() {
        assert!(OperatorError::Timeout("t".into()).requeue_delay().is_some());
        assert!(OperatorError::ValidationError("v".into())
            .requeue_delay()
            .is_none());
    }
}
