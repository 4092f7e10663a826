//! Assembly of the gateway from configuration.
//!
//! Everything here runs once before the listeners bind; any error refuses
//! startup.

use std::path::Path;
use std::sync::Arc;

use tourgate_core::GatewayError;
use tourgate_core::admission::{AdmissionConfig, AdmissionController};
use tourgate_core::cache::{CacheConfig, ResponseCache};
use tourgate_core::config::GatewayDefaults;
use tourgate_core::history::{HistoryStore, InMemoryHistoryStore, JsonlHistoryStore};
use tourgate_core::orchestrator::{Orchestrator, OrchestratorConfig};
use tourgate_core::telemetry::GatewayMetrics;
use tourgate_core::template::{TemplateTable, load_templates};
use tourgate_core::upstream::{
    DEFAULT_SYSTEM_PREAMBLE, HttpCompletionClient, RetryPolicy, UpstreamAdapter, UpstreamConfig,
};
use tracing::{info, warn};

/// The template table from `path`, or the built-in table when unset.
pub fn load_template_table(path: Option<&Path>) -> Result<TemplateTable, GatewayError> {
    match path {
        Some(path) => Ok(load_templates(path)?),
        None => {
            let table = TemplateTable::builtin();
            info!(entries = table.len(), "Using built-in template table");
            Ok(table)
        }
    }
}

/// A JSONL store at `path`, or a bounded in-memory store when unset.
pub async fn open_history_store(
    path: Option<&Path>,
    max_turns_per_session: usize,
    max_sessions: usize,
) -> Result<Arc<dyn HistoryStore>, GatewayError> {
    match path {
        Some(path) => {
            let store = JsonlHistoryStore::open(path).await?;
            info!(path = %store.path().display(), "Appending conversation history to file");
            Ok(Arc::new(store))
        }
        None => {
            info!(
                max_turns_per_session,
                max_sessions, "Keeping conversation history in memory"
            );
            Ok(Arc::new(
                InMemoryHistoryStore::new(max_turns_per_session).with_max_sessions(max_sessions),
            ))
        }
    }
}

/// The retrying upstream adapter, or `None` in offline mode.
pub fn build_upstream(
    config: UpstreamConfig,
    policy: RetryPolicy,
    metrics: Arc<GatewayMetrics>,
) -> Result<Option<UpstreamAdapter>, GatewayError> {
    if config.is_offline() {
        warn!(
            "TOURGATE_UPSTREAM_API_KEY is not set; running offline with templates, cache and fallbacks only"
        );
        return Ok(None);
    }

    info!(
        base_url = %config.base_url,
        model = %config.model,
        max_attempts = policy.max_attempts,
        budget_secs = policy.budget.as_secs(),
        "Upstream completion client configured"
    );
    let client = HttpCompletionClient::new(config)?;
    Ok(Some(
        UpstreamAdapter::new(Arc::new(client), policy).with_metrics(metrics),
    ))
}

/// `TOURGATE_SYSTEM_PREAMBLE` when set and non-blank, else the built-in one.
pub fn system_preamble_from_env() -> String {
    std::env::var("TOURGATE_SYSTEM_PREAMBLE")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PREAMBLE.to_string())
}

/// Components shared by the servers and the background tasks.
pub struct Gateway {
    pub orchestrator: Arc<Orchestrator>,
    pub admission: Arc<AdmissionController>,
    pub cache: Arc<ResponseCache>,
}

impl Gateway {
    /// Wire admission, cache and the pipeline together.
    pub fn assemble(
        defaults: &GatewayDefaults,
        templates: TemplateTable,
        upstream: Option<UpstreamAdapter>,
        history: Arc<dyn HistoryStore>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let admission = Arc::new(
            AdmissionController::new(AdmissionConfig::from(defaults))
                .with_metrics(metrics.clone()),
        );
        let cache = Arc::new(
            ResponseCache::new(CacheConfig::from(defaults)).with_metrics(metrics.clone()),
        );
        let config = OrchestratorConfig {
            system_preamble: system_preamble_from_env(),
            ..OrchestratorConfig::from(defaults)
        };

        let orchestrator = Orchestrator::new(
            Arc::clone(&admission),
            Arc::new(templates),
            Arc::clone(&cache),
            upstream,
            config,
        )
        .with_history(history)
        .with_metrics(metrics);

        Self {
            orchestrator: Arc::new(orchestrator),
            admission,
            cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::registry::Registry;
    use serial_test::serial;
    use tourgate_core::config::ConfigError;

    fn metrics() -> Arc<GatewayMetrics> {
        Arc::new(GatewayMetrics::new(&mut Registry::default()))
    }

    #[test]
    fn test_builtin_templates_when_no_path() {
        let table = load_template_table(None).unwrap();
        assert!(table.find("xin chào").is_some());
    }

    #[test]
    fn test_missing_template_file_refuses_startup() {
        let err = load_template_table(Some(Path::new("/nonexistent/templates.yaml"))).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Config(ConfigError::TemplateFileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        open_history_store(Some(&path), 30, 100).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_history_refuses_startup() {
        let result = open_history_store(Some(Path::new("/nonexistent/h.jsonl")), 30, 100).await;
        assert!(matches!(result, Err(GatewayError::History(_))));
    }

    #[test]
    fn test_offline_without_api_key() {
        let config = UpstreamConfig::default();
        assert!(config.is_offline());
        let upstream = build_upstream(config, RetryPolicy::default(), metrics()).unwrap();
        assert!(upstream.is_none());
    }

    #[test]
    fn test_online_with_api_key() {
        let config = UpstreamConfig::with_base_url("http://127.0.0.1:9", "sk-test");
        let upstream = build_upstream(config, RetryPolicy::default(), metrics()).unwrap();
        assert!(upstream.is_some());
    }

    #[test]
    #[serial]
    fn test_system_preamble_override() {
        unsafe {
            std::env::set_var("TOURGATE_SYSTEM_PREAMBLE", "  Answer in English only.  ");
        }
        assert_eq!(system_preamble_from_env(), "Answer in English only.");
        unsafe {
            std::env::set_var("TOURGATE_SYSTEM_PREAMBLE", "   ");
        }
        assert_eq!(system_preamble_from_env(), DEFAULT_SYSTEM_PREAMBLE);
        unsafe {
            std::env::remove_var("TOURGATE_SYSTEM_PREAMBLE");
        }
    }

    #[tokio::test]
    async fn test_assembled_gateway_shares_admission_and_cache() {
        let defaults = GatewayDefaults::default();
        let history = open_history_store(
            None,
            defaults.max_turns,
            defaults.history_max_sessions,
        )
        .await
        .unwrap();
        let gateway = Gateway::assemble(
            &defaults,
            TemplateTable::builtin(),
            None,
            history,
            metrics(),
        );

        assert!(gateway.orchestrator.is_offline());
        assert!(Arc::ptr_eq(gateway.orchestrator.admission(), &gateway.admission));
        assert!(Arc::ptr_eq(gateway.orchestrator.cache(), &gateway.cache));
    }
}
