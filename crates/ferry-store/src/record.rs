//! Offline transfer records

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ferry_core::PayloadKind;
use serde::Serialize;

/// A stored file belonging to a transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredItem {
    /// Opaque id used in download URLs
    pub id: String,
    pub original_name: String,
    pub size: u64,
    pub mime_type: String,
}

/// An uploaded payload waiting to be retrieved by code
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    pub items: Vec<StoredItem>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub download_count: u32,
    pub max_downloads: u32,
}

impl TransferRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.download_count >= self.max_downloads
    }

    pub fn total_size(&self) -> u64 {
        self.items.iter().map(|item| item.size).sum()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.items.iter().map(|item| item.original_name.clone()).collect()
    }

    /// Length of the text payload in characters
    pub fn text_length(&self) -> usize {
        self.text_content
            .as_ref()
            .map(|t| t.chars().count())
            .unwrap_or(0)
    }

    /// First characters of the text payload
    pub fn text_preview(&self, chars: usize) -> String {
        self.text_content
            .as_ref()
            .map(|t| t.chars().take(chars).collect())
            .unwrap_or_default()
    }
}

/// A file received by the HTTP layer and written to the store's staging area
#[derive(Clone, Debug)]
pub struct IncomingFile {
    pub original_name: String,
    pub mime_type: String,
    /// Staged location; the store moves it into place on `put`
    pub path: PathBuf,
    pub size: u64,
}

/// Everything needed to create a transfer
#[derive(Clone, Debug, Default)]
pub struct NewTransfer {
    pub kind: PayloadKind,
    pub text_content: Option<String>,
    pub files: Vec<IncomingFile>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> TransferRecord {
        let now = Utc::now();
        TransferRecord {
            code: "AB12C3".into(),
            kind: PayloadKind::File,
            text_content: None,
            items: vec![
                StoredItem {
                    id: "a".into(),
                    original_name: "one.txt".into(),
                    size: 10,
                    mime_type: "text/plain".into(),
                },
                StoredItem {
                    id: "b".into(),
                    original_name: "two.bin".into(),
                    size: 32,
                    mime_type: "application/octet-stream".into(),
                },
            ],
            created_at: now,
            expires_at: now + Duration::hours(24),
            download_count: 0,
            max_downloads: 10,
        }
    }

    #[test]
    fn test_summary_fields() {
        let record = record();
        assert_eq!(record.total_size(), 42);
        assert_eq!(record.file_names(), vec!["one.txt", "two.bin"]);
        assert_eq!(record.text_length(), 0);
    }

    #[test]
    fn test_expiry_and_exhaustion() {
        let mut record = record();
        assert!(!record.is_expired(record.created_at));
        assert!(record.is_expired(record.created_at + Duration::hours(25)));

        record.download_count = 10;
        assert!(record.is_exhausted());
    }

    #[test]
    fn test_text_preview() {
        let mut record = record();
        record.kind = PayloadKind::Text;
        record.text_content = Some("x".repeat(150));
        assert_eq!(record.text_length(), 150);
        assert_eq!(record.text_preview(100).len(), 100);
    }
}
