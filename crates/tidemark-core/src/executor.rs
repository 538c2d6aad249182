//! The SQL execution collaborator.
//!
//! The host supplies the transport; the engine only sees this trait. Failures
//! are retryable unless the executor marks them fatal.

use async_trait::async_trait;
use thiserror::Error;

/// Outcome of a successfully executed statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementOutcome {
    /// Rows affected, when the backend reports it.
    pub rows_affected: Option<u64>,
}

/// Statement execution failure.
#[derive(Debug, Clone, Error)]
pub enum SqlError {
    /// Transient failure; the caller may retry the statement.
    #[error("statement failed: {0}")]
    Retryable(String),

    /// Permanent failure; retrying the same statement cannot succeed.
    #[error("statement failed fatally: {0}")]
    Fatal(String),
}

impl SqlError {
    /// Whether this failure should stop retries immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SqlError::Fatal(_))
    }
}

/// Executes a single SQL statement against the target database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute one statement and report its outcome.
    async fn execute(&self, statement: &str) -> Result<StatementOutcome, SqlError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!SqlError::Retryable("timeout".into()).is_fatal());
        assert!(SqlError::Fatal("syntax error".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SqlError::Retryable("connection reset".into());
        assert_eq!(err.to_string(), "statement failed: connection reset");
    }
}
