//! Host-level error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the host while loading configuration or driving plugins.
#[derive(Debug, Error)]
pub enum HostError {
    /// The configuration file could not be read.
    #[error("cannot read config file {path:?}: {source}")]
    ConfigRead {
        /// Path to the config file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("cannot parse config file {path:?}: {reason}")]
    ConfigParse {
        /// Path to the config file.
        path: PathBuf,
        /// Parse failure description.
        reason: String,
    },

    /// A configuration value failed validation.
    #[error("invalid config: {message}")]
    ConfigInvalid {
        /// Description of the invalid value.
        message: String,
    },

    /// A plugin hook failed.
    #[error("plugin '{plugin}' failed during {hook}: {reason}")]
    PluginFailed {
        /// Plugin name.
        plugin: String,
        /// Hook that failed.
        hook: String,
        /// Failure description.
        reason: String,
    },
}
