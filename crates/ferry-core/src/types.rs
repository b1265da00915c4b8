//! Core type definitions for Ferry
//!
//! These types are shared by the signaling relay, the offline store and
//! the HTTP surface.

use serde::{Deserialize, Serialize};

/// Kind of payload being transferred
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    #[default]
    File,
    Text,
    Screen,
    Video,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::File => "file",
            PayloadKind::Text => "text",
            PayloadKind::Screen => "screen",
            PayloadKind::Video => "video",
        }
    }

    /// Whether payloads of this kind carry stored items (files)
    pub fn carries_items(self) -> bool {
        !matches!(self, PayloadKind::Text)
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PayloadKind {
    type Err = UnknownPayloadKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(PayloadKind::File),
            "text" => Ok(PayloadKind::Text),
            "screen" => Ok(PayloadKind::Screen),
            "video" => Ok(PayloadKind::Video),
            _ => Err(UnknownPayloadKind(s.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized payload kind
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown payload kind: {0}")]
pub struct UnknownPayloadKind(pub String);

/// Sender-declared metadata about a pending transfer.
///
/// Advisory only: shown to the receiver before the connection exists and
/// never used to size or limit anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SenderDescriptor {
    /// Payload kind
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    /// Number of items (files) offered
    pub file_count: u32,
    /// Total size in bytes
    pub total_size: u64,
    /// Inline text content, for text transfers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl SenderDescriptor {
    /// Length of the preview shown for text payloads
    pub const PREVIEW_CHARS: usize = 100;

    /// First characters of the text content, if any
    pub fn text_preview(&self) -> Option<String> {
        self.content
            .as_ref()
            .map(|c| c.chars().take(Self::PREVIEW_CHARS).collect())
    }
}

/// Which side of a transfer a participant is on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// The opposite role
    pub fn other(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kind_parse() {
        assert_eq!("file".parse::<PayloadKind>().unwrap(), PayloadKind::File);
        assert_eq!(" Text ".parse::<PayloadKind>().unwrap(), PayloadKind::Text);
        assert_eq!("VIDEO".parse::<PayloadKind>().unwrap(), PayloadKind::Video);
        assert!("audio".parse::<PayloadKind>().is_err());
        assert!(!PayloadKind::Text.carries_items());
        assert!(PayloadKind::Screen.carries_items());
    }

    #[test]
    fn test_descriptor_wire_format() {
        let json = r#"{"type":"text","fileCount":0,"totalSize":5,"content":"hello"}"#;
        let desc: SenderDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.kind, PayloadKind::Text);
        assert_eq!(desc.total_size, 5);
        assert_eq!(desc.text_preview().as_deref(), Some("hello"));

        // Missing fields fall back to defaults
        let desc: SenderDescriptor = serde_json::from_str(r#"{"type":"screen"}"#).unwrap();
        assert_eq!(desc.kind, PayloadKind::Screen);
        assert_eq!(desc.file_count, 0);
        assert!(desc.content.is_none());
    }

    #[test]
    fn test_text_preview_truncates() {
        let desc = SenderDescriptor {
            kind: PayloadKind::Text,
            content: Some("x".repeat(250)),
            ..Default::default()
        };
        assert_eq!(desc.text_preview().unwrap().len(), SenderDescriptor::PREVIEW_CHARS);
    }

    #[test]
    fn test_role_other() {
        assert_eq!(Role::Sender.other(), Role::Receiver);
        assert_eq!(Role::Receiver.to_string(), "receiver");
    }
}
