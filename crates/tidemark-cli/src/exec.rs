//! SQL executors the CLI can host.
//!
//! Transport is not this tool's business: the real executor pipes each
//! statement to a configured client binary (psql-style) and maps its exit
//! status onto the retryable/fatal taxonomy. The echo executor backs
//! `--dry-run` and offline demos.

use async_trait::async_trait;
use std::process::Stdio;
use tidemark_core::{SqlError, SqlExecutor, StatementOutcome};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Pipes statements to a configured client command via stdin.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Build from a command line such as `adb-client --database events --stdin`.
    pub fn new(command_line: &str) -> Result<Self, SqlError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            SqlError::Fatal("database.client_command is empty".to_string())
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl SqlExecutor for CommandExecutor {
    async fn execute(&self, statement: &str) -> Result<StatementOutcome, SqlError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                // A missing or unexecutable client cannot be retried into
                // existence.
                SqlError::Fatal(format!("cannot spawn '{}': {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(statement.as_bytes())
                .await
                .map_err(|e| SqlError::Retryable(format!("writing statement: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SqlError::Retryable(format!("waiting for client: {}", e)))?;

        if output.status.success() {
            Ok(StatementOutcome::default())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SqlError::Retryable(format!(
                "client exited with {}: {}",
                output.status,
                stderr.trim().lines().next().unwrap_or(""),
            )))
        }
    }
}

/// Logs statements without executing anything. Used for `--dry-run`.
#[derive(Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl SqlExecutor for EchoExecutor {
    async fn execute(&self, statement: &str) -> Result<StatementOutcome, SqlError> {
        tracing::info!(statement, "dry-run: statement not executed");
        Ok(StatementOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let exec = CommandExecutor::new("adb-client --stdin --database events").unwrap();
        assert_eq!(exec.program, "adb-client");
        assert_eq!(exec.args, vec!["--stdin", "--database", "events"]);

        assert!(matches!(
            CommandExecutor::new("   "),
            Err(SqlError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let exec = CommandExecutor::new("definitely-not-a-real-binary-xyz").unwrap();
        let result = exec.execute("SELECT 1").await;
        assert!(matches!(result, Err(SqlError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_retryable() {
        let exec = CommandExecutor::new("false").unwrap();
        let result = exec.execute("SELECT 1").await;
        assert!(matches!(result, Err(SqlError::Retryable(_))));
    }

    #[tokio::test]
    async fn test_successful_command() {
        let exec = CommandExecutor::new("cat").unwrap();
        let result = exec.execute("SELECT 1").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_echo_executor_always_succeeds() {
        let result = EchoExecutor.execute("SELECT 1").await;
        assert!(result.is_ok());
    }
}
