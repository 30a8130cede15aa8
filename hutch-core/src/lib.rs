//! Hutch Core - resilience layer for AMQP message brokers
//!
//! Keeps a single broker session alive and builds reliable messaging on top
//! of it. The broker client itself sits behind the [`transport`] traits; an
//! AMQP 0-9-1 adapter over `lapin` is available with the `amqp` feature and
//! [`testing::MockBroker`] is an in-memory implementation for tests.
//!
//! ## Components
//! - `connection`: session manager with health checks, reconnection and
//!   connect/disconnect listeners
//! - `resilience`: backoff, circuit breaker, reconnect loop, health probe
//! - `messaging`: retrying publisher, reconnecting consumer, checker
//! - `monitoring`: service health report, Prometheus metrics, HTTP export
//! - `config`: layered configuration (defaults, TOML file, `HUTCH_*` env)
//!
//! ## Example
//! ```no_run
//! use hutch_core::prelude::*;
//! use hutch_core::testing::MockBroker;
//! use std::sync::Arc;
//!
//! # async fn run() -> hutch_core::Result<()> {
//! let config = HutchConfig::default();
//! let session = SessionManager::from_config(&config, Arc::new(MockBroker::new()));
//! let publisher = RetryingPublisher::from_config(session.clone(), &config);
//!
//! publisher.publish(&Target::queue("orders"), b"hello").await?;
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod messaging;
pub mod monitoring;
pub mod resilience;
pub mod testing;
pub mod transport;
pub mod utils;

pub use crate::core::errors::{HutchError, Result};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::HutchConfig;
    pub use crate::connection::{ListenerId, Session, SessionManager};
    pub use crate::core::{ConnectionSnapshot, HutchError, Result, SessionPhase};
    pub use crate::messaging::{
        handler_fn, Checker, MessageHandler, PublishOptions, ReconnectingConsumer,
        RetryingPublisher, Target,
    };
    pub use crate::monitoring::{HealthReport, HealthStatus, ServiceMonitor};
    pub use crate::resilience::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitError};
    pub use crate::transport::{Delivery, Transport};
}
