//! The backfill plugin, as seen by the host.
//!
//! The host drives the plugin through the hook surface in `tidemark-core`;
//! everything else in this crate hangs off the engine the CLI constructs.

use crate::gate;
use crate::options::ResolvedBackfill;
use crate::store::StateStore;
use async_trait::async_trait;
use tidemark_core::{
    CheckContext, CheckFinding, HostError, MigrationPlugin, OutputSink, ResolvedConfig, Severity,
};

/// Plugin name; also the key of its section in the config file.
pub const PLUGIN_NAME: &str = "backfill";

/// The backfill plugin.
#[derive(Debug, Default)]
pub struct BackfillPlugin;

impl BackfillPlugin {
    /// Create the plugin.
    pub fn new() -> Self {
        Self
    }

    fn resolve(&self, config: &ResolvedConfig) -> Result<ResolvedBackfill, HostError> {
        ResolvedBackfill::from_plugin_table(config.plugin_table(PLUGIN_NAME)).map_err(|e| {
            HostError::ConfigInvalid {
                message: format!("bad '{}' section: {}", PLUGIN_NAME, e),
            }
        })
    }
}

#[async_trait]
impl MigrationPlugin for BackfillPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn on_config_loaded(&self, config: &ResolvedConfig) -> Result<(), HostError> {
        // Fail early on a malformed section rather than at first use.
        let resolved = self.resolve(config)?;
        tracing::debug!(
            chunk_hours = resolved.options.chunk_hours,
            max_parallel = resolved.options.max_parallel_chunks,
            "backfill configuration resolved"
        );
        Ok(())
    }

    async fn on_check(&self, ctx: &CheckContext<'_>) -> Result<Vec<CheckFinding>, HostError> {
        let resolved = self.resolve(ctx.config)?;
        let store = StateStore::new(&ctx.config.state_dir);
        gate::evaluate(&store, &resolved).map_err(|e| HostError::PluginFailed {
            plugin: PLUGIN_NAME.to_string(),
            hook: "on_check".to_string(),
            reason: e.to_string(),
        })
    }

    async fn on_check_report(
        &self,
        findings: &[CheckFinding],
        out: &dyn OutputSink,
    ) -> Result<(), HostError> {
        let errors = findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count();
        if errors == 0 {
            return Ok(());
        }
        out.print(&format!(
            "backfill: {} blocking finding(s); run `tidemark backfill doctor <plan-id>` for recovery steps",
            errors,
        ));
        for finding in findings {
            if finding.code == gate::CODE_CHUNK_RETRY_EXHAUSTED {
                out.print(
                    "backfill: exhausted chunks can be re-executed with `backfill resume --replay-failed`",
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tidemark_core::BufferSink;

    fn config_with(
        state_dir: PathBuf,
        table: Option<serde_json::Value>,
    ) -> ResolvedConfig {
        let mut plugins = BTreeMap::new();
        if let Some(table) = table {
            plugins.insert(PLUGIN_NAME.to_string(), table);
        }
        ResolvedConfig {
            database: None,
            state_dir,
            plugins,
        }
    }

    #[tokio::test]
    async fn test_on_config_loaded_rejects_bad_section() {
        let plugin = BackfillPlugin::new();
        let config = config_with(
            PathBuf::from("/tmp"),
            Some(serde_json::json!({"chunk_hours": "not a number"})),
        );
        let result = plugin.on_config_loaded(&config).await;
        assert!(matches!(result, Err(HostError::ConfigInvalid { .. })));
    }

    #[tokio::test]
    async fn test_on_check_reports_missing_required_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = BackfillPlugin::new();
        let config = config_with(
            dir.path().to_path_buf(),
            Some(serde_json::json!({"policy": {"required_targets": ["events"]}})),
        );

        let ctx = CheckContext { config: &config };
        let findings = plugin.on_check(&ctx).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code, gate::CODE_PLAN_MISSING);

        let sink = BufferSink::new();
        plugin.on_check_report(&findings, &sink).await.unwrap();
        assert!(sink.lines()[0].contains("1 blocking finding"));
    }

    #[tokio::test]
    async fn test_on_check_report_silent_when_clean() {
        let plugin = BackfillPlugin::new();
        let sink = BufferSink::new();
        plugin.on_check_report(&[], &sink).await.unwrap();
        assert!(sink.lines().is_empty());
    }
}
