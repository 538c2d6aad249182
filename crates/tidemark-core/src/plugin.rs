//! The plugin hook surface.
//!
//! Plugins extend the migration CLI through a small set of typed hooks the
//! host calls at well-defined points. There is no implicit registration; the
//! host constructs its plugins and invokes them directly.

use crate::config::ResolvedConfig;
use crate::error::HostError;
use crate::findings::CheckFinding;
use crate::output::OutputSink;
use async_trait::async_trait;

/// Context handed to `on_check`.
pub struct CheckContext<'a> {
    /// The resolved host configuration.
    pub config: &'a ResolvedConfig,
}

/// A plugin hosted by the migration CLI.
#[async_trait]
pub trait MigrationPlugin: Send + Sync {
    /// Stable plugin name; also the key of its config table.
    fn name(&self) -> &'static str;

    /// Called once after the host resolves its configuration.
    async fn on_config_loaded(&self, config: &ResolvedConfig) -> Result<(), HostError>;

    /// Called by the host's preflight check. Returns findings; never blocks
    /// directly.
    async fn on_check(&self, ctx: &CheckContext<'_>) -> Result<Vec<CheckFinding>, HostError>;

    /// Called after the host prints its check summary, letting the plugin add
    /// diagnostics of its own.
    async fn on_check_report(
        &self,
        findings: &[CheckFinding],
        out: &dyn OutputSink,
    ) -> Result<(), HostError>;
}
