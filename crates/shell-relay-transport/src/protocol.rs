//! Wire protocol for client-server communication.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use shell_relay_core::Backend;

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Terminal input data (base64 encoded).
    Input { data: String },
    /// Resize terminal.
    Resize { cols: u16, rows: u16 },
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Create an input message from raw bytes.
    #[must_use]
    pub fn input(data: &[u8]) -> Self {
        Self::Input {
            data: BASE64.encode(data),
        }
    }

    /// Decode input data from base64.
    #[must_use]
    pub fn decode_input(&self) -> Option<Vec<u8>> {
        if let Self::Input { data } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A shell is attached to this connection.
    SessionStarted { session_id: String, backend: Backend },
    /// Terminal output data (base64 encoded).
    Output { data: String },
    /// Diagnostic from the relay, such as the process exit notice.
    Notice { message: String },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Create an output message from raw bytes.
    #[must_use]
    pub fn output(data: &[u8]) -> Self {
        Self::Output {
            data: BASE64.encode(data),
        }
    }

    /// Decode output data from base64.
    #[must_use]
    pub fn decode_output(&self) -> Option<Vec<u8>> {
        if let Self::Output { data } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_bytes_survive_encoding() {
        let original = b"ls\n\x1b[A\xff";
        let msg = ClientMessage::input(original);
        assert_eq!(msg.decode_input().unwrap(), original);
        assert_eq!(ClientMessage::Ping.decode_input(), None);
    }

    #[test]
    fn bad_base64_does_not_decode() {
        let msg = ClientMessage::Input {
            data: "not base64!".into(),
        };
        assert_eq!(msg.decode_input(), None);
    }

    #[test]
    fn client_messages_use_type_tag() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        if let ClientMessage::Resize { cols, rows } = parsed {
            assert_eq!((cols, rows), (120, 40));
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn session_started_names_backend() {
        let msg = ServerMessage::SessionStarted {
            session_id: "c1".into(),
            backend: Backend::CompatShell,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session_started");
        assert_eq!(json["backend"], "compatibility-shell");
    }
}
