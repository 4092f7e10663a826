//! Public chat endpoint.
//!
//! `POST /chat` always answers `200 OK` with a [`ChatReply`]: malformed
//! bodies become empty conversations, oversize bodies get the `oversize`
//! fallback, and every failure inside the pipeline is already a fallback
//! reply by the time it reaches this layer.
//!
//! axum's default body limit is disabled so oversize bodies never turn into
//! a bare `413`; the handler enforces `max_body_bytes` itself while reading.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::Extensions,
    routing::post,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tourgate_core::{CallerKey, ChatReply, ChatRequest, Orchestrator};
use tracing::{info, warn};

/// Shared state of the chat router.
#[derive(Clone)]
pub struct ChatState {
    pub orchestrator: Arc<Orchestrator>,
    /// Turns kept from each inbound conversation.
    pub max_turns: usize,
    /// Largest body read before answering with the `oversize` fallback.
    pub max_body_bytes: usize,
}

/// Router exposing `POST /chat`.
pub fn chat_router(state: ChatState) -> Router {
    // Size is checked in the handler so the reply stays a chat message
    Router::new()
        .route("/chat", post(chat_handler))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Serve the chat router on `addr` until `shutdown` is cancelled.
///
/// Connections are served with peer addresses so anonymous callers can be
/// keyed by IP.
pub async fn serve_chat(
    addr: &str,
    state: ChatState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Chat server listening");

    axum::serve(
        listener,
        chat_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        info!("Chat server shutting down");
    })
    .await?;

    Ok(())
}

async fn chat_handler(
    State(state): State<ChatState>,
    extensions: Extensions,
    body: Body,
) -> Json<ChatReply> {
    let body = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Json(state.orchestrator.reject_oversize(state.max_body_bytes));
        }
        Err(e) => {
            // Unreadable bodies are treated like malformed ones
            warn!(error = %e, "Failed to read chat request body");
            Default::default()
        }
    };

    let request = ChatRequest::from_slice(&body, state.max_turns);
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let caller = resolve_caller(&request, peer);

    Json(state.orchestrator.handle(request, caller).await)
}

/// `callerId` when present, else the peer IP, else the shared anonymous key.
pub fn resolve_caller(request: &ChatRequest, peer: Option<SocketAddr>) -> CallerKey {
    match (&request.caller_id, peer) {
        (Some(id), _) => CallerKey::new(id.as_str()),
        (None, Some(addr)) => CallerKey::new(addr.ip().to_string()),
        (None, None) => CallerKey::anonymous(),
    }
}
