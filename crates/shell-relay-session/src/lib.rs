//! Connection-to-process session management.
//!
//! Provides:
//! - `SessionManager` - Spawn with backend fallback, wiring, idempotent teardown
//! - `Outbound` - What a session sends back to its connection
//! - `Health` - Liveness snapshot for the HTTP layer

pub mod manager;

pub use manager::{
    ConnectionId, Health, OUTBOUND_CAPACITY, Outbound, SessionError, SessionInfo, SessionManager,
};
