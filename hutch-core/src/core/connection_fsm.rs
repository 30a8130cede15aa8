//! Session State Machine
//!
//! Tracks the single broker session (connection + channel) and the flags
//! that drive reconnection.
//!
//! # State Diagram
//!
//! ```text
//!   DISCONNECTED ──connect──→ CONNECTING ──channel ready──→ HEALTHY
//!                                 ▲  │                         │
//!                                 │  └──failed──┐     error/close/probe
//!                                 │             ▼              ▼
//!                                 └────────── UNHEALTHY ◄───────┘
//!
//!   any state ──close()──→ CLOSED (terminal)
//! ```
//!
//! **Invariants** (checked by every transition):
//! - `is_healthy` implies both handles are present
//! - `reconnect_attempts` only grows while `is_connecting` is set
//! - `reconnect_attempts` is zero whenever `is_healthy` is set

use crate::transport::{BrokerChannel, BrokerConnection};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Lifecycle phase of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Never connected
    Disconnected,
    /// A connect sequence is in flight
    Connecting,
    /// Connection and channel usable, last probe succeeded
    Healthy,
    /// Session lost; reconnection pending or running
    Unhealthy,
    /// Deliberately closed; terminal
    Closed,
}

/// Read-only view of the session, safe to hand to any task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub phase: SessionPhase,
    pub is_healthy: bool,
    pub is_connecting: bool,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub has_connection: bool,
    pub has_channel: bool,
    pub generation: u64,
}

/// Mutable session state, exclusively owned by the session manager
pub struct SessionState {
    phase: SessionPhase,
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    is_connecting: bool,
    is_healthy: bool,
    reconnect_attempts: u32,
    last_error: Option<String>,
    generation: u64,
}

/// Handles removed from the state, to be closed outside the lock
pub struct StaleHandles {
    pub connection: Option<Arc<dyn BrokerConnection>>,
    pub channel: Option<Arc<dyn BrokerChannel>>,
}

impl StaleHandles {
    pub fn is_empty(&self) -> bool {
        self.connection.is_none() && self.channel.is_none()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            connection: None,
            channel: None,
            is_connecting: false,
            is_healthy: false,
            reconnect_attempts: 0,
            last_error: None,
            generation: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }

    pub fn is_connecting(&self) -> bool {
        self.is_connecting
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Current handles, only when healthy
    pub fn healthy_handles(&self) -> Option<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>)> {
        if !self.is_healthy {
            return None;
        }
        match (&self.connection, &self.channel) {
            (Some(conn), Some(ch)) => Some((Arc::clone(conn), Arc::clone(ch))),
            _ => None,
        }
    }

    /// Transition: * → Connecting
    ///
    /// Detaches whatever handles are left so the caller can close them, and
    /// starts a new generation. Events from older generations are ignored.
    pub fn begin_connect(&mut self) -> (u64, StaleHandles) {
        self.is_healthy = false;
        self.phase = SessionPhase::Connecting;
        self.generation += 1;
        let stale = StaleHandles {
            connection: self.connection.take(),
            channel: self.channel.take(),
        };
        (self.generation, stale)
    }

    /// Keep a connection whose channel could not be created
    pub fn park_connection(&mut self, generation: u64, connection: Arc<dyn BrokerConnection>) {
        if self.generation == generation && !self.is_closed() {
            self.connection = Some(connection);
        }
    }

    /// Transition: Connecting → Healthy
    ///
    /// Returns false when the generation was superseded or the session closed
    /// while connecting; the handles are then handed back untouched.
    pub fn mark_healthy(
        &mut self,
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<(), StaleHandles> {
        if self.generation != generation || self.is_closed() {
            return Err(StaleHandles {
                connection: Some(connection),
                channel: Some(channel),
            });
        }
        self.connection = Some(connection);
        self.channel = Some(channel);
        self.is_healthy = true;
        self.reconnect_attempts = 0;
        self.last_error = None;
        self.phase = SessionPhase::Healthy;
        Ok(())
    }

    /// Transition: Connecting → Unhealthy (connect sequence failed)
    pub fn mark_connect_failed(&mut self, generation: u64, error: String) {
        if self.is_closed() {
            return;
        }
        self.last_error = Some(error);
        if self.generation == generation {
            self.is_healthy = false;
            self.phase = SessionPhase::Unhealthy;
        }
    }

    /// Transition: Healthy → Unhealthy
    ///
    /// Returns true only for the call that actually demoted the session of
    /// `generation`, so loss notifications fire once per session.
    pub fn mark_lost(&mut self, generation: u64, error: Option<String>) -> bool {
        if self.generation != generation || !self.is_healthy || self.is_closed() {
            return false;
        }
        self.is_healthy = false;
        self.phase = SessionPhase::Unhealthy;
        if error.is_some() {
            self.last_error = error;
        }
        true
    }

    /// Claim the reconnection loop; false if one is already running
    pub fn try_begin_reconnect(&mut self) -> bool {
        if self.is_connecting || self.is_closed() {
            return false;
        }
        self.is_connecting = true;
        true
    }

    /// Count a failed reconnection attempt
    pub fn record_reconnect_failure(&mut self, error: String) -> u32 {
        if self.is_connecting {
            self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        }
        self.last_error = Some(error);
        self.reconnect_attempts
    }

    /// Start a fresh attempt budget after exhaustion
    pub fn reset_reconnect_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    /// Release the reconnection loop claim
    ///
    /// Returns false and keeps the claim when the session was lost again
    /// before the loop finished; the caller must run another loop.
    pub fn end_reconnect(&mut self) -> bool {
        if !self.is_healthy && !self.is_closed() {
            return false;
        }
        self.is_connecting = false;
        if self.is_healthy {
            self.reconnect_attempts = 0;
        }
        true
    }

    /// Transition: * → Closed
    pub fn mark_closed(&mut self) -> StaleHandles {
        self.is_healthy = false;
        self.is_connecting = false;
        self.phase = SessionPhase::Closed;
        self.generation += 1;
        StaleHandles {
            connection: self.connection.take(),
            channel: self.channel.take(),
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            phase: self.phase,
            is_healthy: self.is_healthy,
            is_connecting: self.is_connecting,
            reconnect_attempts: self.reconnect_attempts,
            last_error: self.last_error.clone(),
            has_connection: self.connection.is_some(),
            has_channel: self.channel.is_some(),
            generation: self.generation,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("phase", &self.phase)
            .field("has_connection", &self.connection.is_some())
            .field("has_channel", &self.channel.is_some())
            .field("is_connecting", &self.is_connecting)
            .field("is_healthy", &self.is_healthy)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("last_error", &self.last_error)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;
    use crate::transport::Transport;

    async fn handles() -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let broker = MockBroker::new();
        let conn = broker.connect("amqp://mock").await.unwrap();
        let ch = conn.create_channel().await.unwrap();
        (conn, ch)
    }

    #[test]
    fn test_initial_state() {
        let state = SessionState::new();
        let snap = state.snapshot();
        assert_eq!(snap.phase, SessionPhase::Disconnected);
        assert!(!snap.is_healthy);
        assert!(!snap.has_connection);
        assert!(state.healthy_handles().is_none());
    }

    #[tokio::test]
    async fn test_connect_then_lose() {
        let mut state = SessionState::new();
        let (gen, stale) = state.begin_connect();
        assert!(stale.is_empty());
        assert_eq!(state.phase(), SessionPhase::Connecting);

        let (conn, ch) = handles().await;
        assert!(state.mark_healthy(gen, conn, ch).is_ok());
        assert!(state.healthy_handles().is_some());

        // Only the first loss notification for a generation counts
        assert!(state.mark_lost(gen, Some("reset".into())));
        assert!(!state.mark_lost(gen, None));
        assert_eq!(state.phase(), SessionPhase::Unhealthy);
        assert!(state.healthy_handles().is_none());
        assert_eq!(state.snapshot().last_error.as_deref(), Some("reset"));
    }

    #[tokio::test]
    async fn test_stale_generation_is_rejected() {
        let mut state = SessionState::new();
        let (old_gen, _) = state.begin_connect();
        let (new_gen, _) = state.begin_connect();
        assert_ne!(old_gen, new_gen);

        let (conn, ch) = handles().await;
        assert!(state.mark_healthy(old_gen, conn, ch).is_err());
        assert!(!state.is_healthy());
    }

    #[tokio::test]
    async fn test_reconnect_counter_rules() {
        let mut state = SessionState::new();

        // Not counted outside a reconnection loop
        state.record_reconnect_failure("refused".into());
        assert_eq!(state.reconnect_attempts(), 0);

        assert!(state.try_begin_reconnect());
        assert!(!state.try_begin_reconnect());
        state.record_reconnect_failure("refused".into());
        state.record_reconnect_failure("refused".into());
        assert_eq!(state.reconnect_attempts(), 2);

        let (gen, _) = state.begin_connect();
        let (conn, ch) = handles().await;
        state.mark_healthy(gen, conn, ch).ok();
        assert_eq!(state.reconnect_attempts(), 0);

        assert!(state.end_reconnect());
        assert!(!state.is_connecting());
    }

    #[tokio::test]
    async fn test_loss_before_loop_ends_keeps_claim() {
        let mut state = SessionState::new();
        assert!(state.try_begin_reconnect());

        let (gen, _) = state.begin_connect();
        let (conn, ch) = handles().await;
        state.mark_healthy(gen, conn, ch).ok();

        // Lost again while the recovering loop still holds the claim
        assert!(state.mark_lost(gen, Some("reset".into())));
        assert!(!state.try_begin_reconnect());

        assert!(!state.end_reconnect());
        assert!(state.is_connecting());

        state.mark_closed();
        assert!(state.end_reconnect());
        assert!(!state.is_connecting());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let mut state = SessionState::new();
        let (gen, _) = state.begin_connect();
        let (conn, ch) = handles().await;
        state.mark_healthy(gen, conn, ch).ok();

        let stale = state.mark_closed();
        assert!(stale.connection.is_some() && stale.channel.is_some());
        assert_eq!(state.phase(), SessionPhase::Closed);
        assert!(!state.try_begin_reconnect());
        assert!(!state.mark_lost(gen, None));
    }
}
