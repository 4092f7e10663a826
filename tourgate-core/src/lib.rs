//! TourGate Core: the request pipeline behind the tourism chat assistant.
//!
//! A chat request passes through admission control, the static template
//! table, the response cache and finally a retrying upstream completion
//! call. Every stage can short-circuit with a reply; failures become fixed
//! fallback messages instead of errors. The HTTP surface lives in
//! `tourgate-proxy`.

pub mod admission;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod error;
pub mod fallback;
pub mod fingerprint;
pub mod history;
pub mod orchestrator;
pub mod telemetry;
pub mod template;
pub mod upstream;

pub use admission::{AdmissionController, AdmissionPermit, CallerKey};
pub use cache::ResponseCache;
pub use conversation::{ChatRequest, Conversation, Role, Turn};
pub use error::GatewayError;
pub use orchestrator::{ChatReply, Orchestrator, OrchestratorConfig, ReplySource};
pub use template::TemplateTable;
