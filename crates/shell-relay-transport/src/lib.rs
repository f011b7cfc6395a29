//! Connection gateway for the terminal relay.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - Connection gate hook consuming a pre-validated identity (feature: websocket)
//! - WebSocket gateway and health route (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod gate;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use gate::{AllowAll, ConnectionGate, GateRejection, Identity, TrustedHeader};
pub use protocol::{ClientMessage, ServerMessage};
