//! TourGate HTTP surface.
//!
//! The public chat endpoint, the admin server with health probes and
//! metrics, process lifecycle and the startup wiring around the
//! `tourgate-core` pipeline.

pub mod admin;
pub mod chat;
pub mod lifecycle;
pub mod ports;
pub mod startup;
