//! Worker telemetry: an atomic metrics registry with Prometheus text
//! exposition, and the HTTP endpoint serving it alongside a health probe.

pub mod metrics;
pub mod server;

pub use metrics::{metrics, MetricsRegistry};
pub use server::MetricsServer;
