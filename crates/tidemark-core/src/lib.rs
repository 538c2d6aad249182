//! Host contracts for the Tidemark migration CLI.
//!
//! Tidemark is a schema-migration tool extended by plugins. This crate holds
//! the narrow interfaces the host and its plugins agree on:
//! - Resolved configuration and environment fingerprinting
//! - The `SqlExecutor` collaborator for statement execution
//! - The plugin hook surface (`on_config_loaded`, `on_check`, `on_check_report`)
//! - Structured check findings consumed by the host's preflight check
//! - The output sink plugins print through
//!
//! Plugins never talk to a terminal, a config file, or a database connection
//! directly; everything arrives through these seams so behavior is
//! reproducible in tests.

pub mod config;
pub mod error;
pub mod executor;
pub mod findings;
pub mod output;
pub mod plugin;

pub use config::{DatabaseConfig, EnvironmentFingerprint, ResolvedConfig};
pub use error::HostError;
pub use executor::{SqlError, SqlExecutor, StatementOutcome};
pub use findings::{CheckFinding, Severity};
pub use output::{BufferSink, OutputSink, StdoutSink};
pub use plugin::{CheckContext, MigrationPlugin};
