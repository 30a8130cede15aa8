//! Broker session lifecycle
//!
//! [`SessionManager`] owns the connection and channel, reconnects with
//! backoff, probes health and notifies listeners.

pub mod listeners;
pub mod manager;

pub use listeners::ListenerId;
pub use manager::{Session, SessionManager};
