//! Testing utilities
//!
//! [`MockBroker`] is an in-memory transport with failure injection and call
//! recording. It is public so downstream crates can exercise their own
//! publish/consume code against scripted outages.

pub mod mock_broker;

pub use mock_broker::{MockBroker, PublishOutcome, PublishedMessage};
