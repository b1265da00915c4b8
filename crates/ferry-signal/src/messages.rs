//! Signal protocol messages
//!
//! JSON objects tagged by `type`, e.g.
//! `{"type":"join-room","code":"AB12C3","isReceiver":true}`.
//! Session descriptions and candidates are carried as opaque JSON values;
//! the relay never looks inside them.

use ferry_core::{ErrorCode, Role, SenderDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a client sends to the relay
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Sender opens a room. Without a code the relay picks one.
    CreateRoom {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        sender_descriptor: SenderDescriptor,
    },

    /// Receiver joins a room by code
    JoinRoom {
        code: String,
        #[serde(default = "default_true")]
        is_receiver: bool,
    },

    /// Sender's session description
    Offer { code: String, sdp: Value },

    /// Receiver's session description
    Answer { code: String, sdp: Value },

    /// Network path hint from either side
    IceCandidate { code: String, candidate: Value },

    /// Sender abandons the room before the transfer starts
    Cancel { code: String },

    /// Either side ends the transfer
    Stop {
        code: String,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        transfer_type: Option<String>,
    },

    /// Pause the transfer (forwarded only)
    Pause { code: String },

    /// Resume the transfer (forwarded only)
    Resume { code: String },

    /// Keepalive
    Ping { timestamp: u64 },
}

fn default_true() -> bool {
    true
}

impl ClientMessage {
    /// Code of the room the message is addressed to, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientMessage::CreateRoom { code, .. } => code.as_deref(),
            ClientMessage::JoinRoom { code, .. }
            | ClientMessage::Offer { code, .. }
            | ClientMessage::Answer { code, .. }
            | ClientMessage::IceCandidate { code, .. }
            | ClientMessage::Cancel { code }
            | ClientMessage::Stop { code, .. }
            | ClientMessage::Pause { code }
            | ClientMessage::Resume { code } => Some(code),
            ClientMessage::Ping { .. } => None,
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages the relay sends to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Room opened for the sender
    RoomCreated { code: String },

    /// Receiver attached to the room
    RoomJoined {
        code: String,
        sender_descriptor: SenderDescriptor,
    },

    /// No live room under this code
    RoomNotFound { code: String },

    /// Room already has a receiver
    RoomFull { code: String },

    /// Code already taken by a live room
    RoomExists { code: String },

    /// Tells the sender its receiver arrived
    ReceiverJoined { code: String },

    /// Forwarded sender description
    Offer { code: String, sdp: Value },

    /// Forwarded receiver description
    Answer { code: String, sdp: Value },

    /// Forwarded network path hint
    IceCandidate { code: String, candidate: Value },

    /// Sender cancelled before the transfer started
    TransferCancelled { code: String },

    /// The other participant's transport closed
    PeerLeft { code: String },

    /// The other participant stopped the transfer
    TransferStopped {
        code: String,
        reason: String,
        stopped_by: Role,
        transfer_type: String,
    },

    /// The other participant paused
    TransferPaused { code: String },

    /// The other participant resumed
    TransferResumed { code: String },

    /// Room reached its maximum age
    RoomExpired { code: String },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Pong response
    Pong { timestamp: u64 },
}

impl ServerMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::PayloadKind;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let msg = ClientMessage::from_json(
            r#"{"type":"create-room","code":"AB12C3","senderDescriptor":{"type":"file","fileCount":2,"totalSize":1024}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::CreateRoom {
                code,
                sender_descriptor,
            } => {
                assert_eq!(code.as_deref(), Some("AB12C3"));
                assert_eq!(sender_descriptor.kind, PayloadKind::File);
                assert_eq!(sender_descriptor.file_count, 2);
            }
            _ => panic!("wrong message type"),
        }

        let msg = ClientMessage::from_json(r#"{"type":"join-room","code":"AB12C3"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                code: "AB12C3".into(),
                is_receiver: true
            }
        );
    }

    #[test]
    fn test_stop_defaults() {
        let msg = ClientMessage::from_json(r#"{"type":"stop","code":"AB12C3"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Stop {
                code: "AB12C3".into(),
                reason: String::new(),
                transfer_type: None
            }
        );
        assert_eq!(msg.code(), Some("AB12C3"));
    }

    #[test]
    fn test_payload_is_opaque() {
        let sdp = json!({"type": "offer", "sdp": "v=0\r\n", "extra": [1, 2, 3]});
        let msg = ServerMessage::Offer {
            code: "AB12C3".into(),
            sdp: sdp.clone(),
        };
        let parsed = ServerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, ServerMessage::Offer { code: "AB12C3".into(), sdp });
    }

    #[test]
    fn test_transfer_stopped_fields() {
        let msg = ServerMessage::TransferStopped {
            code: "AB12C3".into(),
            reason: "user".into(),
            stopped_by: Role::Sender,
            transfer_type: "sending".into(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"transfer-stopped""#));
        assert!(json.contains(r#""stoppedBy":"sender""#));
        assert!(json.contains(r#""transferType":"sending""#));
    }

    #[test]
    fn test_error_message() {
        let msg = ServerMessage::error(ErrorCode::NotParticipant, "only the sender may offer");
        let json = msg.to_json().unwrap();

        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("not_participant"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"warp","code":"AB12C3"}"#).is_err());
    }
}
