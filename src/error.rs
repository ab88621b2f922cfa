//! Error types for the Anamnesis validation pipeline
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation at the
//! binary boundary.

use thiserror::Error;

/// Main error type for Anamnesis operations
#[derive(Error, Debug)]
pub enum AnamnesisError {
    /// Test report could not be parsed (malformed XML or attributes)
    #[error("Report parse error at byte {position}: {message}")]
    ReportParse { position: u64, message: String },

    /// Advisory lock on a workflow record could not be acquired in time
    #[error("Lock timeout on workflow {0}")]
    LockTimeout(String),

    /// No code evidence could be found for a transition
    #[error("Correlation inconclusive for workflow {workflow_id}: {reason}")]
    CorrelationInconclusive { workflow_id: String, reason: String },

    /// Document store write failed after exhausting retries
    #[error("Store write failed: {0}")]
    StoreWrite(String),

    /// Learning was written but the source chat status update failed
    #[error("Partial promotion: learning {learning_id} written, chat {chat_id} status update failed")]
    PartialPromotion { learning_id: String, chat_id: String },

    /// Attempted workflow state change violates the state machine
    #[error("Invalid workflow transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Workflow record not found
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Version-control inspector failed
    #[error("VCS error: {0}")]
    Vcs(String),

    /// Invalid workflow or learning ID format
    #[error("Invalid ID: {0}")]
    InvalidId(#[from] uuid::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Anamnesis operations
pub type Result<T> = std::result::Result<T, AnamnesisError>;

/// Convert anyhow::Error to AnamnesisError
impl From<anyhow::Error> for AnamnesisError {
    fn from(err: anyhow::Error) -> Self {
        AnamnesisError::Other(err.to_string())
    }
}

impl From<libsql::Error> for AnamnesisError {
    fn from(err: libsql::Error) -> Self {
        AnamnesisError::Database(err.to_string())
    }
}

impl AnamnesisError {
    /// Whether the caller may retry the failed operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnamnesisError::LockTimeout(_) | AnamnesisError::StoreWrite(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnamnesisError::WorkflowNotFound("wf-123".to_string());
        assert_eq!(err.to_string(), "Workflow not found: wf-123");
    }

    #[test]
    fn test_parse_error_carries_position() {
        let err = AnamnesisError::ReportParse {
            position: 42,
            message: "unexpected end of document".to_string(),
        };
        assert!(err.to_string().contains("byte 42"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AnamnesisError::LockTimeout("wf".into()).is_retryable());
        assert!(AnamnesisError::StoreWrite("boom".into()).is_retryable());
        assert!(!AnamnesisError::WorkflowNotFound("wf".into()).is_retryable());
    }

    #[test]
    fn test_error_conversion() {
        let uuid_err = uuid::Uuid::parse_str("invalid");
        assert!(uuid_err.is_err());

        let err: AnamnesisError = uuid_err.unwrap_err().into();
        assert!(matches!(err, AnamnesisError::InvalidId(_)));
    }
}
