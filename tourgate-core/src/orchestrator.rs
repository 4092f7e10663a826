//! The chat request pipeline.
//!
//! ```text
//! Received ─┬─ Rejected ─────────────────────────────────────────► busy reply
//!           └─ Admitted → TemplateCheck → CacheCheck → UpstreamCall → Respond
//!                              │hit           │hit         │fail
//!                              ▼              ▼            ▼
//!                           template       cached      classified fallback
//! ```
//!
//! Every path ends in a [`ChatReply`]; nothing here returns an error. The
//! admission permit is dropped before the reply is handed back, and a panic
//! anywhere after admission is caught at this boundary, answered with the
//! generic fallback, and still releases the permit.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, CallerKey};
use crate::cache::ResponseCache;
use crate::config::GatewayDefaults;
use crate::conversation::{ChatRequest, Turn};
use crate::fallback::FallbackReason;
use crate::fingerprint::Fingerprint;
use crate::history::HistoryStore;
use crate::telemetry::GatewayMetrics;
use crate::template::TemplateTable;
use crate::upstream::{CompletionRequest, DEFAULT_SYSTEM_PREAMBLE, UpstreamAdapter};

// ============================================================================
// Reply
// ============================================================================

/// Where a reply's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    Template,
    Cache,
    Upstream,
    Fallback,
}

impl ReplySource {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplySource::Template => "template",
            ReplySource::Cache => "cache",
            ReplySource::Upstream => "upstream",
            ReplySource::Fallback => "fallback",
        }
    }
}

/// Reply metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMeta {
    pub source: ReplySource,
    /// Fallback tag, present only when `source` is `fallback`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fallback: Option<String>,
    /// Upstream attempts made, present when the upstream was called.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attempts: Option<u32>,
    pub correlation_id: String,
}

/// The assistant message returned for every chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub role: String,
    pub content: String,
    pub meta: ReplyMeta,
}

impl ChatReply {
    fn new(source: ReplySource, content: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            meta: ReplyMeta {
                source,
                fallback: None,
                attempts: None,
                correlation_id: correlation_id.to_string(),
            },
        }
    }

    /// A canned reply for `reason`.
    pub fn fallback(reason: FallbackReason, correlation_id: &str) -> Self {
        let mut reply = Self::new(ReplySource::Fallback, reason.message(), correlation_id);
        reply.meta.fallback = Some(reason.tag().to_string());
        reply
    }

    fn with_attempts(mut self, attempts: u32) -> Self {
        self.meta.attempts = Some(attempts);
        self
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Pipeline settings that are not owned by a component.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Trailing turns that feed the cache fingerprint.
    pub fingerprint_turns: usize,
    /// Preamble sent ahead of the conversation upstream.
    pub system_preamble: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&GatewayDefaults::default())
    }
}

impl From<&GatewayDefaults> for OrchestratorConfig {
    fn from(defaults: &GatewayDefaults) -> Self {
        Self {
            fingerprint_turns: defaults.fingerprint_turns,
            system_preamble: DEFAULT_SYSTEM_PREAMBLE.to_string(),
        }
    }
}

/// Composes admission, templates, cache and upstream into one pipeline.
pub struct Orchestrator {
    admission: Arc<AdmissionController>,
    templates: Arc<TemplateTable>,
    cache: Arc<ResponseCache>,
    /// `None` in offline mode.
    upstream: Option<UpstreamAdapter>,
    history: Option<Arc<dyn HistoryStore>>,
    config: OrchestratorConfig,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl Orchestrator {
    pub fn new(
        admission: Arc<AdmissionController>,
        templates: Arc<TemplateTable>,
        cache: Arc<ResponseCache>,
        upstream: Option<UpstreamAdapter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            admission,
            templates,
            cache,
            upstream,
            history: None,
            config,
            metrics: None,
        }
    }

    /// Append each exchange to `store` in the background.
    pub fn with_history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn is_offline(&self) -> bool {
        self.upstream.is_none()
    }

    /// Answer one chat request. Never fails.
    pub async fn handle(&self, request: ChatRequest, caller: CallerKey) -> ChatReply {
        let correlation_id = Uuid::new_v4().to_string();
        let span = info_span!("chat", caller = %caller, correlation_id = %correlation_id);

        let reply = async {
            // Received → Admitted | Rejected
            let permit = match self.admission.try_admit(&caller) {
                Ok(permit) => permit,
                Err(rejected) => {
                    return ChatReply::fallback(
                        FallbackReason::Busy(rejected.reason),
                        &correlation_id,
                    );
                }
            };

            let outcome = AssertUnwindSafe(self.run_admitted(&request, &caller, &correlation_id))
                .catch_unwind()
                .await;

            // Release before responding
            drop(permit);

            match outcome {
                Ok(reply) => {
                    self.record_history(&request, &caller, &reply);
                    reply
                }
                Err(panic) => {
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        "Chat pipeline panicked, answering with fallback"
                    );
                    ChatReply::fallback(FallbackReason::Internal, &correlation_id)
                }
            }
        }
        .instrument(span)
        .await;

        if let Some(ref metrics) = self.metrics {
            metrics.record_reply(reply.meta.source.as_str());
        }
        reply
    }

    /// Answer a request whose body was too large to read.
    ///
    /// Nothing about the caller is known, so admission and history are
    /// skipped.
    pub fn reject_oversize(&self, limit: usize) -> ChatReply {
        let correlation_id = Uuid::new_v4().to_string();
        warn!(
            limit,
            correlation_id = %correlation_id,
            "Request body exceeds size limit, answering with fallback"
        );
        if let Some(ref metrics) = self.metrics {
            metrics.record_reply(ReplySource::Fallback.as_str());
        }
        ChatReply::fallback(FallbackReason::Oversize, &correlation_id)
    }

    /// TemplateCheck → CacheCheck → UpstreamCall, while holding a permit.
    async fn run_admitted(
        &self,
        request: &ChatRequest,
        caller: &CallerKey,
        correlation_id: &str,
    ) -> ChatReply {
        let conversation = &request.conversation;
        let Some(prompt) = conversation.latest_user_prompt() else {
            debug!("Conversation has no user prompt");
            return ChatReply::fallback(FallbackReason::Empty, correlation_id);
        };

        if let Some(hit) = self.templates.lookup(prompt) {
            debug!(kind = ?hit.kind, "Template hit");
            return ChatReply::new(ReplySource::Template, hit.response, correlation_id);
        }

        let fingerprint = Fingerprint::compute(caller, conversation, self.config.fingerprint_turns);
        if let Some(cached) = self.cache.get(&fingerprint) {
            debug!(fingerprint = ?fingerprint, "Cache hit");
            return ChatReply::new(ReplySource::Cache, cached, correlation_id);
        }

        let Some(ref upstream) = self.upstream else {
            debug!("No upstream credentials, answering offline");
            return ChatReply::fallback(FallbackReason::Offline, correlation_id);
        };

        let completion = CompletionRequest {
            system_preamble: self.config.system_preamble.clone(),
            turns: conversation.turns().to_vec(),
        };

        match upstream.call(&completion, correlation_id).await {
            Ok(success) => {
                // Cached under the fingerprint computed before the call
                self.cache.put(fingerprint, success.text.clone());
                ChatReply::new(ReplySource::Upstream, success.text, correlation_id)
                    .with_attempts(success.attempts)
            }
            Err(failure) => {
                warn!(
                    kind = %failure.kind,
                    attempts = failure.attempts,
                    "Answering with upstream fallback"
                );
                ChatReply::fallback(FallbackReason::Upstream(failure.kind), correlation_id)
                    .with_attempts(failure.attempts)
            }
        }
    }

    /// Fire-and-forget append of the prompt and reply.
    fn record_history(&self, request: &ChatRequest, caller: &CallerKey, reply: &ChatReply) {
        let Some(ref store) = self.history else {
            return;
        };
        let Some(prompt) = request.conversation.latest_user_prompt() else {
            return;
        };

        let store = Arc::clone(store);
        let caller_id = request
            .caller_id
            .clone()
            .unwrap_or_else(|| caller.as_str().to_string());
        let session_id = request.session_id.clone();
        let turns = [Turn::user(prompt), Turn::assistant(reply.content.clone())];

        tokio::spawn(async move {
            for turn in &turns {
                if let Err(e) = store
                    .append_turn(&caller_id, session_id.as_deref(), turn)
                    .await
                {
                    warn!(caller = %caller_id, error = %e, "Failed to append conversation history");
                    return;
                }
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::cache::CacheConfig;
    use crate::conversation::Conversation;
    use crate::history::InMemoryHistoryStore;
    use crate::upstream::{CompletionError, CompletionService, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct EchoService {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl CompletionService for EchoService {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let last = request.turns.last().map(|t| t.content.as_str()).unwrap_or("");
            Ok(format!("echo: {last}"))
        }
    }

    struct PanickingService;

    #[async_trait::async_trait]
    impl CompletionService for PanickingService {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, CompletionError> {
            panic!("upstream client bug");
        }
    }

    fn orchestrator(service: Option<Arc<dyn CompletionService>>) -> Orchestrator {
        let admission = Arc::new(AdmissionController::new(AdmissionConfig {
            max_global: 4,
            max_per_caller: 2,
            cooldown: Duration::ZERO,
            idle_ttl: Duration::from_secs(60),
        }));
        let upstream = service.map(|s| {
            UpstreamAdapter::new(
                s,
                RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(1),
                    budget: Duration::from_secs(5),
                    jitter: false,
                },
            )
        });
        Orchestrator::new(
            admission,
            Arc::new(TemplateTable::builtin()),
            Arc::new(ResponseCache::new(CacheConfig::default())),
            upstream,
            OrchestratorConfig::default(),
        )
    }

    fn ask(prompt: &str) -> ChatRequest {
        ChatRequest {
            conversation: Conversation::new(vec![Turn::user(prompt)], 30),
            caller_id: Some("alice".to_string()),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_upstream_answer_is_cached() {
        let service = Arc::new(EchoService {
            calls: AtomicU32::new(0),
        });
        let orch = orchestrator(Some(service.clone()));
        let caller = CallerKey::new("alice");

        let first = orch.handle(ask("Is Da Lat cold in December?"), caller.clone()).await;
        assert_eq!(first.meta.source, ReplySource::Upstream);
        assert_eq!(first.meta.attempts, Some(1));
        assert_eq!(first.content, "echo: Is Da Lat cold in December?");

        let second = orch.handle(ask("Is Da Lat cold in December?"), caller).await;
        assert_eq!(second.meta.source, ReplySource::Cache);
        assert_eq!(second.content, first.content);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_conversation_skips_pipeline() {
        let orch = orchestrator(None);
        let reply = orch.handle(ChatRequest::default(), CallerKey::anonymous()).await;
        assert_eq!(reply.role, "assistant");
        assert_eq!(reply.meta.fallback.as_deref(), Some("empty"));
        assert_eq!(orch.admission().global_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_offline_mode_still_serves_templates() {
        let orch = orchestrator(None);
        let caller = CallerKey::new("bob");

        let greeting = orch.handle(ask("xin chào"), caller.clone()).await;
        assert_eq!(greeting.meta.source, ReplySource::Template);

        let offline = orch.handle(ask("Bus from Hanoi to Ninh Binh?"), caller).await;
        assert_eq!(offline.meta.fallback.as_deref(), Some("offline"));
        assert_eq!(offline.meta.attempts, None);
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_permit_released() {
        let orch = orchestrator(Some(Arc::new(PanickingService)));
        let reply = orch.handle(ask("Crash please"), CallerKey::new("eve")).await;

        assert_eq!(reply.meta.source, ReplySource::Fallback);
        assert_eq!(reply.meta.fallback.as_deref(), Some("internal"));
        let stats = orch.admission().stats();
        assert_eq!(stats.global_in_flight, 0);
        assert_eq!(stats.admitted_total, stats.released_total);
    }

    #[tokio::test]
    async fn test_history_receives_prompt_and_reply() {
        let store = Arc::new(InMemoryHistoryStore::new(10));
        let orch = orchestrator(None).with_history(store.clone());

        let reply = orch.handle(ask("Xin chào"), CallerKey::new("alice")).await;

        // Append runs on a spawned task
        for _ in 0..100 {
            if store.records("alice", None).len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let records = store.records("alice", None);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "Xin chào");
        assert_eq!(records[1].content, reply.content);
    }

    #[test]
    fn test_oversize_reply_skips_admission() {
        let orch = orchestrator(None);
        let reply = orch.reject_oversize(1024);

        assert_eq!(reply.meta.source, ReplySource::Fallback);
        assert_eq!(reply.meta.fallback.as_deref(), Some("oversize"));
        assert!(!reply.meta.correlation_id.is_empty());
        assert_eq!(orch.admission().stats().admitted_total, 0);
    }

    #[test]
    fn test_reply_serialization_shape() {
        let reply = ChatReply::fallback(FallbackReason::Offline, "abc");
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["meta"]["source"], "fallback");
        assert_eq!(value["meta"]["fallback"], "offline");
        assert_eq!(value["meta"]["correlationId"], "abc");
        assert!(value["meta"].get("attempts").is_none());
    }
}
