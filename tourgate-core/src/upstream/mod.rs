//! Upstream completion service access.
//!
//! - [`CompletionService`]: one attempt against the external service
//! - [`HttpCompletionClient`]: reqwest implementation for OpenAI-compatible APIs
//! - [`UpstreamAdapter`]: classified retries with exponential backoff under a
//!   total wall-clock budget

mod adapter;
mod client;
mod error;

use serde::Serialize;

use crate::conversation::Turn;

pub use adapter::{RetryPolicy, UpstreamAdapter, UpstreamSuccess};
pub use client::{HttpCompletionClient, UpstreamConfig};
pub use error::{CompletionError, FailureKind, UpstreamFailure};

/// Default system preamble sent ahead of every conversation.
pub const DEFAULT_SYSTEM_PREAMBLE: &str = "You are a friendly travel assistant for a Vietnamese \
tourism site. Answer concisely about destinations, food, transport, opening hours and local \
customs. Reply in the language the traveller writes in.";

/// Payload of one completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub system_preamble: String,
    pub turns: Vec<Turn>,
}

/// A single attempt against the external completion service.
///
/// Implementations must not retry internally; [`UpstreamAdapter`] owns the
/// retry policy. Tests substitute scripted implementations.
#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    /// Request one completion for `request`.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}
