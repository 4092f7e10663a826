//! Gateway observability.
//!
//! Structured logging goes through `tracing` directly in each component; the
//! subscriber is installed by the binary. This module holds the Prometheus
//! metrics exposed on the admin port.

pub mod prom_metrics;

pub use prom_metrics::GatewayMetrics;
