//! Offline transfer endpoints
//!
//! Codes in paths are matched case-insensitively. `receive` is the only
//! endpoint that consumes a download; `download` streams an item of a
//! transfer that has already been received.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use ferry_core::{generate_unique_code, normalize_code, PayloadKind, SenderDescriptor};
use ferry_signal::Room;
use ferry_store::{IncomingFile, NewTransfer, StoreError, TransferRecord};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{AppState, Envelope, TransferType};
use crate::error::ApiError;

/// Characters of text shown in `info` previews
const PREVIEW_CHARS: usize = SenderDescriptor::PREVIEW_CHARS;

/// What `info` reports about a code
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub is_online: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_downloads: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_connected: Option<bool>,
    /// Seconds since the room was opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_age: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_preview: Option<String>,
}

impl TransferSummary {
    fn offline(record: &TransferRecord) -> Self {
        let is_text = record.kind == PayloadKind::Text;
        Self {
            code: record.code.clone(),
            kind: record.kind,
            is_online: false,
            timestamp: record.created_at,
            download_count: Some(record.download_count),
            max_downloads: Some(record.max_downloads),
            expires_at: Some(record.expires_at),
            sender_connected: None,
            receiver_connected: None,
            room_age: None,
            file_count: (!is_text).then(|| record.items.len() as u64),
            total_size: (!is_text).then(|| record.total_size()),
            file_names: (!is_text).then(|| record.file_names()),
            text_length: is_text.then(|| record.text_length()),
            text_preview: is_text.then(|| record.text_preview(PREVIEW_CHARS)),
        }
    }

    fn online(room: &Room, now: Instant) -> Self {
        let age = room.age(now);
        let opened = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or_else(Utc::now);
        let descriptor = &room.descriptor;

        Self {
            code: room.code.clone(),
            kind: descriptor.kind,
            is_online: true,
            timestamp: opened,
            download_count: None,
            max_downloads: None,
            expires_at: None,
            // A room only lives while its sender is connected
            sender_connected: Some(true),
            receiver_connected: Some(room.receiver().is_some()),
            room_age: Some(age.as_secs()),
            file_count: Some(u64::from(descriptor.file_count)),
            total_size: Some(descriptor.total_size),
            file_names: None,
            text_length: descriptor.content.as_ref().map(|c| c.chars().count()),
            text_preview: descriptor.text_preview(),
        }
    }
}

/// Result of an upload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub file_count: usize,
    pub expires_at: DateTime<Utc>,
    pub max_downloads: u32,
}

/// A stored file as handed to the receiver
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLink {
    pub original_name: String,
    pub size: u64,
    pub mime_type: String,
    pub download_url: String,
}

/// Payload returned by `receive`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedTransfer {
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub timestamp: DateTime<Utc>,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<DownloadLink>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
}

/// Counters and timestamps reported by `status`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub is_online: bool,
    pub download_count: u32,
    pub max_downloads: u32,
    pub expires_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Store an uploaded payload under a fresh code
///
/// POST /api/upload (multipart: `type`, `textContent`, `files`)
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Envelope<UploadResult>>, ApiError> {
    let mut staged = Vec::new();

    let (kind, text_content) = match read_upload(&state, &mut multipart, &mut staged).await {
        Ok(fields) => fields,
        Err(e) => {
            discard_staged(&staged).await;
            return Err(e);
        }
    };

    let staged_paths: Vec<PathBuf> = staged.iter().map(|f| f.path.clone()).collect();
    let upload = NewTransfer {
        kind,
        text_content,
        files: staged,
    };

    // Codes are unique across stored transfers and live rooms
    let rooms = Arc::clone(&state.rooms);
    let stored = state
        .with_store(move |store| {
            let now = Instant::now();
            let code = generate_unique_code(|candidate| {
                store.has(candidate).unwrap_or(true) || rooms.has(candidate, now)
            })
            .map_err(|e| ApiError::Internal(e.to_string()))?;
            Ok(store.put(&code, upload, Utc::now())?)
        })
        .await;

    let record = match stored {
        Ok(record) => record,
        Err(e) => {
            for path in &staged_paths {
                remove_staged(path).await;
            }
            return Err(e);
        }
    };

    info!("Upload stored as {} ({})", record.code, record.kind);

    Ok(Json(Envelope {
        success: true,
        message: Some("Upload complete".into()),
        code: Some(record.code.clone()),
        data: Some(UploadResult {
            kind: record.kind,
            file_count: record.items.len(),
            expires_at: record.expires_at,
            max_downloads: record.max_downloads,
        }),
        ..Envelope::default()
    }))
}

/// Describe what a code refers to
///
/// GET /api/info/:code
pub async fn info(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Envelope<TransferSummary>>, ApiError> {
    let code = normalize_code(&code);

    // Stored transfers first, then live rooms
    let lookup = code.clone();
    let stored = state
        .with_store(move |store| Ok(store.info(&lookup, Utc::now())?))
        .await;
    match stored {
        Ok(record) => {
            return Ok(Json(Envelope {
                transfer_type: Some(TransferType::Offline),
                ..Envelope::ok(TransferSummary::offline(&record))
            }))
        }
        Err(ApiError::Store(StoreError::NotFound)) => {}
        Err(e) => return Err(e),
    }

    let now = Instant::now();
    match state.rooms.get(&code, now) {
        Ok(room) => Ok(Json(Envelope {
            transfer_type: Some(TransferType::Online),
            ..Envelope::ok(TransferSummary::online(&room, now))
        })),
        Err(e) => {
            debug!("No transfer or room for {}: {}", code, e);
            Err(ApiError::UnknownCode)
        }
    }
}

/// Retrieve a payload, consuming one download
///
/// GET /api/receive/:code
pub async fn receive(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Envelope<ReceivedTransfer>>, ApiError> {
    let code = normalize_code(&code);
    let record = state
        .with_store(move |store| Ok(store.receive(&code, Utc::now())?))
        .await?;

    let files = (record.kind != PayloadKind::Text).then(|| {
        record
            .items
            .iter()
            .map(|item| DownloadLink {
                original_name: item.original_name.clone(),
                size: item.size,
                mime_type: item.mime_type.clone(),
                download_url: format!("/api/download/{}/{}", record.code, item.id),
            })
            .collect()
    });

    Ok(Json(Envelope::ok(ReceivedTransfer {
        kind: record.kind,
        timestamp: record.created_at,
        is_online: false,
        files,
        text_content: record.text_content,
    })))
}

/// Stream one stored file
///
/// GET /api/download/:code/:item_id
pub async fn download(
    State(state): State<AppState>,
    Path((code, item_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let code = normalize_code(&code);
    let (lookup, wanted) = (code.clone(), item_id.clone());
    let (item, path) = state
        .with_store(move |store| Ok(store.item(&lookup, &wanted, Utc::now())?))
        .await?;

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        warn!("Failed to open payload {}/{}: {}", code, item_id, e);
        ApiError::Store(StoreError::NotFound)
    })?;

    let content_type = HeaderValue::from_str(&item.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&content_disposition(&item.original_name))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let headers = [
        (header::CONTENT_TYPE, content_type),
        (header::CONTENT_DISPOSITION, disposition),
        (header::CONTENT_LENGTH, HeaderValue::from(item.size)),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

/// Report counters without consuming a download
///
/// GET /api/status/:code
pub async fn status(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Envelope<TransferStatus>>, ApiError> {
    let code = normalize_code(&code);
    let record = state
        .with_store(move |store| Ok(store.status(&code)?))
        .await?;

    Ok(Json(Envelope::ok(TransferStatus {
        code: record.code,
        kind: record.kind,
        is_online: false,
        download_count: record.download_count,
        max_downloads: record.max_downloads,
        expires_at: record.expires_at,
        timestamp: record.created_at,
    })))
}

/// Read the multipart form, staging files as they arrive
async fn read_upload(
    state: &AppState,
    multipart: &mut Multipart,
    staged: &mut Vec<IncomingFile>,
) -> Result<(PayloadKind, Option<String>), ApiError> {
    let mut kind = None;
    let mut text_content = None;
    let mut remaining = state.config.max_upload_bytes;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "type" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                kind = Some(
                    value
                        .parse::<PayloadKind>()
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            "textContent" => {
                text_content = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.body_text()))?,
                );
            }
            "files" => {
                if staged.len() >= state.config.max_files {
                    return Err(ApiError::BadRequest(format!(
                        "at most {} files per transfer",
                        state.config.max_files
                    )));
                }
                let file = stage_file(state, &mut field, &mut remaining).await?;
                staged.push(file);
            }
            other => debug!("Ignoring upload field {:?}", other),
        }
    }

    let kind = kind.ok_or_else(|| ApiError::BadRequest("missing transfer type".into()))?;
    Ok((kind, text_content))
}

/// Write one file field to the staging area
async fn stage_file(
    state: &AppState,
    field: &mut Field<'_>,
    remaining: &mut u64,
) -> Result<IncomingFile, ApiError> {
    let original_name = sanitize_file_name(field.file_name().unwrap_or_default());
    let mime_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();
    let path = state.store.staging_path()?;

    match write_field(field, &path, remaining).await {
        Ok(size) => Ok(IncomingFile {
            original_name,
            mime_type,
            path,
            size,
        }),
        Err(e) => {
            remove_staged(&path).await;
            Err(e)
        }
    }
}

async fn write_field(
    field: &mut Field<'_>,
    path: &std::path::Path,
    remaining: &mut u64,
) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ApiError::Store(StoreError::Io(e)))?;
    let mut size = 0u64;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let len = chunk.len() as u64;
        if len > *remaining {
            return Err(ApiError::BadRequest("upload too large".into()));
        }
        *remaining -= len;
        size += len;
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::Store(StoreError::Io(e)))?;
    }

    file.flush()
        .await
        .map_err(|e| ApiError::Store(StoreError::Io(e)))?;
    Ok(size)
}

async fn discard_staged(staged: &[IncomingFile]) {
    for file in staged {
        remove_staged(&file.path).await;
    }
}

/// Remove a staged upload. Files already moved into the store are gone
/// from the staging area, which is fine.
async fn remove_staged(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove staged upload {:?}: {}", path, e);
        }
    }
}

/// Keep only the final path component of a client-supplied file name
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}

/// `Content-Disposition` value with an ASCII fallback and the UTF-8 name
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut encoded = String::with_capacity(name.len() * 3);
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'~') {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{:02X}", b));
        }
    }

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name(".."), "file");
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("a b.txt"),
            "attachment; filename=\"a b.txt\"; filename*=UTF-8''a%20b.txt"
        );
        let value = content_disposition("résumé.pdf");
        assert!(value.contains("filename=\"r_sum_.pdf\""));
        assert!(value.contains("filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }

    #[test]
    fn test_offline_summary_for_text() {
        let now = Utc::now();
        let record = TransferRecord {
            code: "TXT001".into(),
            kind: PayloadKind::Text,
            text_content: Some("y".repeat(120)),
            items: Vec::new(),
            created_at: now,
            expires_at: now + chrono::Duration::hours(24),
            download_count: 2,
            max_downloads: 10,
        };

        let summary = TransferSummary::offline(&record);
        assert_eq!(summary.text_length, Some(120));
        assert_eq!(summary.text_preview.map(|p| p.len()), Some(100));
        assert!(summary.file_count.is_none());
        assert_eq!(summary.download_count, Some(2));
    }
}
