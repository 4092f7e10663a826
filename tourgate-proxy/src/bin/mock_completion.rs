//! Mock OpenAI-compatible completion server for local runs.
//!
//! Answers `POST /v1/chat/completions` by echoing the latest user message,
//! so the gateway can be exercised end to end without credentials.
//!
//! # Environment Variables
//!
//! - `MOCK_COMPLETION_PORT`: Listen port (default: 9998)
//! - `MOCK_COMPLETION_DELAY_MS`: Response delay in milliseconds (default: 0)
//! - `MOCK_COMPLETION_FAIL_STATUS`: When set, every request fails with this status
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin mock-completion
//! TOURGATE_UPSTREAM_URL=http://127.0.0.1:9998 TOURGATE_UPSTREAM_API_KEY=dev \
//!     cargo run --bin tourgate-proxy
//! ```

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    content: String,
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

async fn handle_completion(Json(body): Json<CompletionBody>) -> Response {
    if let Some(delay_ms) = env_u64("MOCK_COMPLETION_DELAY_MS").filter(|ms| *ms > 0) {
        sleep(Duration::from_millis(delay_ms)).await;
    }

    if let Some(status) = env_u64("MOCK_COMPLETION_FAIL_STATUS")
        .and_then(|s| u16::try_from(s).ok())
        .and_then(|s| StatusCode::from_u16(s).ok())
    {
        let error = serde_json::json!({"error": {"message": "mock failure", "type": "mock"}});
        return (status, Json(error)).into_response();
    }

    let prompt = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .unwrap_or("");

    Json(serde_json::json!({
        "id": format!("mock-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "model": body.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": format!("(mock) Bạn hỏi: {prompt}")},
            "finish_reason": "stop"
        }]
    }))
    .into_response()
}

async fn health() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = env_u64("MOCK_COMPLETION_PORT")
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(9998);

    let app = Router::new()
        .route("/v1/chat/completions", post(handle_completion))
        .route("/health", get(health));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    println!("Mock completion server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
