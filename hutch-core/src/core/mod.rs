//! Core types shared by every component
//!
//! - `errors`: the library error taxonomy
//! - `connection_fsm`: session lifecycle state machine and its snapshot

pub mod connection_fsm;
pub mod errors;

pub use connection_fsm::{ConnectionSnapshot, SessionPhase, SessionState};
pub use errors::{HutchError, Result};
