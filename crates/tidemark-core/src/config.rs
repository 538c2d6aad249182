//! Resolved host configuration.
//!
//! The host loads one JSON config file, resolves it against defaults, and
//! hands the result to plugins via `on_config_loaded`. Plugins read their own
//! section out of `plugins`; the engine never reads ambient process state.

use crate::error::HostError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".tidemark";

/// Target database connection settings.
///
/// Transport is handled by an external client; the host only needs enough to
/// fingerprint the environment and to hand statements off for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database endpoint URL (e.g. `https://analytics.example.com:8443/v1`).
    pub endpoint: String,
    /// Database name within the endpoint.
    pub database: String,
    /// Client command the CLI pipes statements to (e.g. `adb-client --stdin`).
    /// Optional; commands that never execute SQL don't need it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_command: Option<String>,
}

impl DatabaseConfig {
    /// Compute the environment fingerprint for this configuration.
    pub fn fingerprint(&self) -> EnvironmentFingerprint {
        EnvironmentFingerprint {
            endpoint: endpoint_origin(&self.endpoint),
            database: self.database.clone(),
        }
    }
}

/// Identity of a database environment: endpoint origin plus database name.
///
/// Plans created against a live configuration are bound to this fingerprint
/// so they cannot silently run against a different environment later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    /// Endpoint origin (`scheme://host[:port]`, no path or credentials).
    pub endpoint: String,
    /// Database name.
    pub database: String,
}

impl std::fmt::Display for EnvironmentFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.database)
    }
}

/// Reduce an endpoint URL to its origin: `scheme://host[:port]`.
///
/// Credentials and paths never participate in the fingerprint, so rotating a
/// password or moving an API prefix does not invalidate existing plans.
fn endpoint_origin(endpoint: &str) -> String {
    let (scheme, rest) = match endpoint.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => return endpoint.trim_end_matches('/').to_string(),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    // Strip userinfo if present.
    let host = authority.rsplit('@').next().unwrap_or(authority);
    format!("{}://{}", scheme, host)
}

/// On-disk shape of the config file. Everything is optional; resolution fills
/// in defaults exactly once so nothing downstream sees a partial config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Target database settings.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// State directory for persisted plans, runs, and event logs.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Raw per-plugin configuration tables, keyed by plugin name.
    #[serde(default)]
    pub plugins: BTreeMap<String, serde_json::Value>,
}

/// Fully-resolved host configuration handed to plugins.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Target database, when one is configured. Offline invocations (planning
    /// without a live database) leave this unset.
    pub database: Option<DatabaseConfig>,
    /// State directory for persisted plans, runs, and event logs.
    pub state_dir: PathBuf,
    /// Raw per-plugin configuration tables, keyed by plugin name.
    pub plugins: BTreeMap<String, serde_json::Value>,
}

impl ResolvedConfig {
    /// Resolve a parsed config file against defaults.
    pub fn from_file(file: ConfigFile) -> Self {
        Self {
            database: file.database,
            state_dir: file
                .state_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            plugins: file.plugins,
        }
    }

    /// Load and resolve a config file from disk.
    pub fn load(path: &Path) -> Result<Self, HostError> {
        let raw = std::fs::read_to_string(path).map_err(|source| HostError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile =
            serde_json::from_str(&raw).map_err(|e| HostError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let resolved = Self::from_file(file);
        tracing::debug!(
            path = %path.display(),
            state_dir = %resolved.state_dir.display(),
            has_database = resolved.database.is_some(),
            "configuration loaded"
        );
        Ok(resolved)
    }

    /// Environment fingerprint of the active database, if one is configured.
    pub fn environment(&self) -> Option<EnvironmentFingerprint> {
        self.database.as_ref().map(DatabaseConfig::fingerprint)
    }

    /// Raw configuration table for a plugin, if the file carries one.
    pub fn plugin_table(&self, name: &str) -> Option<&serde_json::Value> {
        self.plugins.get(name)
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}
