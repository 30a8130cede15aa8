//! Monitoring and observability module
//!
//! Service health classification, Prometheus metrics export and the HTTP
//! server that exposes both.

pub mod metrics;
pub mod server;
pub mod service;

pub use metrics::{ConnectionMetrics, MessagingMetrics, MetricsRegistry};
pub use server::{MetricsServer, MetricsServerConfig};
pub use service::{classify, HealthReport, HealthStatus, NamedCircuit, ServiceMetrics, ServiceMonitor};
