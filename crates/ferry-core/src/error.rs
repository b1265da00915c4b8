//! Error kinds shared across Ferry components

use serde::{Deserialize, Serialize};

/// Wire error codes (sent to clients)
///
/// Every crate maps its own error type onto one of these so that callers
/// only ever see the named kind, never internal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Bad or expired code
    NotFound,
    /// Code collision on create
    AlreadyExists,
    /// Room already has a receiver
    Full,
    /// No peer action within the allotted window
    Timeout,
    /// Abrupt disconnect of the underlying transport
    TransportClosed,
    /// Offline download limit reached
    Exhausted,
    /// Offline transfer past its lifetime
    Expired,
    /// Code does not match the code format
    InvalidCode,
    /// Message not allowed in the room's current state
    InvalidTransition,
    /// Caller is not the participant the message requires
    NotParticipant,
    /// Malformed request
    BadRequest,
    /// Internal server error
    Internal,
}

impl ErrorCode {
    /// Human-readable description for end users
    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "code does not exist or has expired",
            ErrorCode::AlreadyExists => "code is already in use",
            ErrorCode::Full => "someone else is already receiving this transfer",
            ErrorCode::Timeout => "the other side did not respond in time",
            ErrorCode::TransportClosed => "the connection to the other side was lost",
            ErrorCode::Exhausted => "download limit reached",
            ErrorCode::Expired => "code has expired",
            ErrorCode::InvalidCode => "codes are six letters or digits",
            ErrorCode::InvalidTransition => "not allowed at this stage of the transfer",
            ErrorCode::NotParticipant => "not a participant of this transfer",
            ErrorCode::BadRequest => "malformed request",
            ErrorCode::Internal => "internal server error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&ErrorCode::TransportClosed).unwrap();
        assert_eq!(json, "\"transport_closed\"");

        let parsed: ErrorCode = serde_json::from_str("\"not_found\"").unwrap();
        assert_eq!(parsed, ErrorCode::NotFound);
    }
}
