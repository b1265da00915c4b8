//! SQLite-backed offline transfer store
//!
//! Records and item descriptors live in SQLite; payload bytes live on disk
//! under `<data_dir>/blobs/<code>/<item_id>`. Uploads are written to
//! `<data_dir>/staging` first and moved into place when the record is
//! committed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use ferry_core::{ErrorCode, OfflineConfig, PayloadKind};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::record::{NewTransfer, StoredItem, TransferRecord};

/// Offline transfer storage
///
/// `now` is passed explicitly so expiry can be exercised without waiting.
pub trait TransferStore: Send + Sync {
    /// Whether a record exists for the code (live or awaiting sweep)
    fn has(&self, code: &str) -> Result<bool, StoreError>;

    /// Create a transfer under `code`, taking ownership of staged files
    fn put(
        &self,
        code: &str,
        upload: NewTransfer,
        now: DateTime<Utc>,
    ) -> Result<TransferRecord, StoreError>;

    /// Look up a transfer without consuming a download
    fn info(&self, code: &str, now: DateTime<Utc>) -> Result<TransferRecord, StoreError>;

    /// Consume one download and return the transfer
    fn receive(&self, code: &str, now: DateTime<Utc>) -> Result<TransferRecord, StoreError>;

    /// Resolve a stored item to its descriptor and blob path
    fn item(
        &self,
        code: &str,
        item_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(StoredItem, PathBuf), StoreError>;

    /// Counters and timestamps, regardless of expiry
    fn status(&self, code: &str) -> Result<TransferRecord, StoreError>;

    /// Delete expired and exhausted transfers with their payloads.
    /// Returns the number of transfers removed.
    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Fresh path in the staging area for an incoming upload
    fn staging_path(&self) -> Result<PathBuf, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Limits applied to new transfers
#[derive(Clone, Debug)]
pub struct StoreLimits {
    pub ttl: Duration,
    pub max_downloads: u32,
    pub max_files: usize,
}

impl From<&OfflineConfig> for StoreLimits {
    fn from(config: &OfflineConfig) -> Self {
        Self {
            ttl: config.ttl(),
            max_downloads: config.max_downloads,
            max_files: config.max_files,
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from(&OfflineConfig::default())
    }
}

/// SQLite storage backend
pub struct SqliteStore {
    conn: Mutex<Connection>,
    blob_dir: PathBuf,
    staging_dir: PathBuf,
    limits: StoreLimits,
}

impl SqliteStore {
    /// Open or create the store rooted at `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P, limits: StoreLimits) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("transfers.db"))?;
        Self::with_connection(conn, data_dir, limits)
    }

    /// In-memory records with blobs under `data_dir` (for testing)
    pub fn in_memory<P: AsRef<Path>>(data_dir: P, limits: StoreLimits) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, data_dir.as_ref(), limits)
    }

    fn with_connection(
        conn: Connection,
        data_dir: &Path,
        limits: StoreLimits,
    ) -> Result<Self, StoreError> {
        let blob_dir = data_dir.join("blobs");
        let staging_dir = data_dir.join("staging");
        fs::create_dir_all(&blob_dir)?;
        fs::create_dir_all(&staging_dir)?;

        let store = Self {
            conn: Mutex::new(conn),
            blob_dir,
            staging_dir,
            limits,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS transfers (
                code TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                text_content TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                download_count INTEGER NOT NULL DEFAULT 0,
                max_downloads INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS items (
                code TEXT NOT NULL,
                item_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                original_name TEXT NOT NULL,
                size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                PRIMARY KEY (code, item_id),
                FOREIGN KEY (code) REFERENCES transfers(code) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_transfers_expires_at ON transfers(expires_at);
            "#,
        )?;

        info!("Storage schema initialized");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn transfer_dir(&self, code: &str) -> PathBuf {
        self.blob_dir.join(code)
    }

    /// Remove a transfer's payload directory. Missing directories are fine.
    fn remove_blobs(&self, code: &str) {
        match fs::remove_dir_all(self.transfer_dir(code)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove payload of {}: {}", code, e),
        }
    }

    fn validate(&self, upload: &NewTransfer) -> Result<(), StoreError> {
        if upload.files.len() > self.limits.max_files {
            return Err(StoreError::InvalidUpload(format!(
                "at most {} files per transfer",
                self.limits.max_files
            )));
        }
        match upload.kind {
            PayloadKind::Text => {
                if upload.text_content.as_deref().map_or(true, str::is_empty) {
                    return Err(StoreError::InvalidUpload("text content is empty".into()));
                }
            }
            kind if kind.carries_items() && upload.files.is_empty() => {
                return Err(StoreError::InvalidUpload("no files uploaded".into()));
            }
            _ => {}
        }
        Ok(())
    }

    /// Move staged files into the transfer's blob directory
    fn place_files(&self, code: &str, upload: &NewTransfer) -> Result<Vec<StoredItem>, StoreError> {
        let dir = self.transfer_dir(code);
        fs::create_dir_all(&dir)?;

        let mut items = Vec::with_capacity(upload.files.len());
        for file in &upload.files {
            let id = new_item_id()?;
            fs::rename(&file.path, dir.join(&id))?;
            items.push(StoredItem {
                id,
                original_name: file.original_name.clone(),
                size: file.size,
                mime_type: file.mime_type.clone(),
            });
        }
        Ok(items)
    }
}

impl TransferStore for SqliteStore {
    fn has(&self, code: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM transfers WHERE code = ?1)",
            params![code],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn put(
        &self,
        code: &str,
        upload: NewTransfer,
        now: DateTime<Utc>,
    ) -> Result<TransferRecord, StoreError> {
        self.validate(&upload)?;

        let mut conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM transfers WHERE code = ?1)",
            params![code],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::AlreadyExists);
        }

        let items = if upload.kind.carries_items() {
            match self.place_files(code, &upload) {
                Ok(items) => items,
                Err(e) => {
                    self.remove_blobs(code);
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        let ttl_ms = i64::try_from(self.limits.ttl.as_millis()).unwrap_or(i64::MAX);
        let created_ms = now.timestamp_millis();
        let expires_ms = created_ms.saturating_add(ttl_ms);
        let text_content = match upload.kind {
            PayloadKind::Text => upload.text_content,
            _ => None,
        };

        let committed = insert_transfer(
            &mut conn,
            code,
            upload.kind,
            text_content.as_deref(),
            &items,
            (created_ms, expires_ms),
            self.limits.max_downloads,
        );

        if let Err(e) = committed {
            self.remove_blobs(code);
            return Err(e.into());
        }

        info!(
            "Stored {} transfer {} ({} items)",
            upload.kind,
            code,
            items.len()
        );

        Ok(TransferRecord {
            code: code.to_string(),
            kind: upload.kind,
            text_content,
            items,
            created_at: from_millis(created_ms)?,
            expires_at: from_millis(expires_ms)?,
            download_count: 0,
            max_downloads: self.limits.max_downloads,
        })
    }

    fn info(&self, code: &str, now: DateTime<Utc>) -> Result<TransferRecord, StoreError> {
        let conn = self.lock()?;
        let record = load_record(&conn, code)?.ok_or(StoreError::NotFound)?;

        if record.is_expired(now) {
            return Err(StoreError::Expired);
        }
        if record.is_exhausted() {
            return Err(StoreError::Exhausted);
        }
        Ok(record)
    }

    fn receive(&self, code: &str, now: DateTime<Utc>) -> Result<TransferRecord, StoreError> {
        let conn = self.lock()?;

        // Only counts when the transfer is still live, so concurrent
        // receivers can never push the counter past the limit
        let updated = conn.execute(
            "UPDATE transfers SET download_count = download_count + 1
             WHERE code = ?1 AND download_count < max_downloads AND expires_at >= ?2",
            params![code, now.timestamp_millis()],
        )?;

        let record = load_record(&conn, code)?.ok_or(StoreError::NotFound)?;
        if updated == 0 {
            if record.is_expired(now) {
                return Err(StoreError::Expired);
            }
            return Err(StoreError::Exhausted);
        }

        debug!(
            "Transfer {} received ({}/{})",
            code, record.download_count, record.max_downloads
        );
        Ok(record)
    }

    fn item(
        &self,
        code: &str,
        item_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(StoredItem, PathBuf), StoreError> {
        let conn = self.lock()?;
        let record = load_record(&conn, code)?.ok_or(StoreError::NotFound)?;
        if record.is_expired(now) {
            return Err(StoreError::Expired);
        }

        let item = record
            .items
            .into_iter()
            .find(|item| item.id == item_id)
            .ok_or(StoreError::NotFound)?;
        let path = self.transfer_dir(code).join(&item.id);
        if !path.is_file() {
            warn!("Payload of {}/{} is missing on disk", code, item_id);
            return Err(StoreError::NotFound);
        }
        Ok((item, path))
    }

    fn status(&self, code: &str) -> Result<TransferRecord, StoreError> {
        let conn = self.lock()?;
        load_record(&conn, code)?.ok_or(StoreError::NotFound)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let now_ms = now.timestamp_millis();

        // Get transfers to delete
        let mut stmt = conn.prepare(
            "SELECT code FROM transfers WHERE expires_at < ?1 OR download_count >= max_downloads",
        )?;
        let codes: Vec<String> = stmt
            .query_map(params![now_ms], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for code in &codes {
            conn.execute("DELETE FROM items WHERE code = ?1", params![code])?;
            conn.execute("DELETE FROM transfers WHERE code = ?1", params![code])?;
            self.remove_blobs(code);
        }

        if !codes.is_empty() {
            info!("Cleaned up {} offline transfers", codes.len());
        }
        Ok(codes.len())
    }

    fn staging_path(&self) -> Result<PathBuf, StoreError> {
        Ok(self.staging_dir.join(new_item_id()?))
    }

    fn len(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM transfers", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Insert a transfer and its items in one transaction
fn insert_transfer(
    conn: &mut Connection,
    code: &str,
    kind: PayloadKind,
    text_content: Option<&str>,
    items: &[StoredItem],
    (created_ms, expires_ms): (i64, i64),
    max_downloads: u32,
) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO transfers (code, kind, text_content, created_at, expires_at, download_count, max_downloads)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![code, kind.as_str(), text_content, created_ms, expires_ms, max_downloads],
    )?;
    for (position, item) in items.iter().enumerate() {
        tx.execute(
            "INSERT INTO items (code, item_id, position, original_name, size, mime_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                code,
                item.id,
                position as i64,
                item.original_name,
                item.size as i64,
                item.mime_type,
            ],
        )?;
    }
    tx.commit()
}

/// Load a transfer and its items
fn load_record(conn: &Connection, code: &str) -> Result<Option<TransferRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT kind, text_content, created_at, expires_at, download_count, max_downloads
             FROM transfers WHERE code = ?1",
            params![code],
            |row| {
                let kind: String = row.get(0)?;
                let text_content: Option<String> = row.get(1)?;
                let created_at: i64 = row.get(2)?;
                let expires_at: i64 = row.get(3)?;
                let download_count: u32 = row.get(4)?;
                let max_downloads: u32 = row.get(5)?;

                Ok((kind, text_content, created_at, expires_at, download_count, max_downloads))
            },
        )
        .optional()?;

    let Some((kind, text_content, created_at, expires_at, download_count, max_downloads)) = row
    else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT item_id, original_name, size, mime_type FROM items WHERE code = ?1 ORDER BY position",
    )?;
    let items = stmt
        .query_map(params![code], |row| {
            let size: i64 = row.get(2)?;
            Ok(StoredItem {
                id: row.get(0)?,
                original_name: row.get(1)?,
                size: size as u64,
                mime_type: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(TransferRecord {
        code: code.to_string(),
        kind: kind
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{}", e)))?,
        text_content,
        items,
        created_at: from_millis(created_at)?,
        expires_at: from_millis(expires_at)?,
        download_count,
        max_downloads,
    }))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

/// Random id for stored items and staged uploads
fn new_item_id() -> Result<String, StoreError> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).map_err(|e| StoreError::Entropy(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transfer not found")]
    NotFound,

    #[error("transfer expired")]
    Expired,

    #[error("download limit reached")]
    Exhausted,

    #[error("code already in use")]
    AlreadyExists,

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("system entropy source unavailable: {0}")]
    Entropy(String),

    /// Mutex lock was poisoned (a thread panicked while holding the lock)
    #[error("lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,
}

impl From<&StoreError> for ErrorCode {
    fn from(e: &StoreError) -> Self {
        match e {
            StoreError::NotFound => ErrorCode::NotFound,
            StoreError::Expired => ErrorCode::Expired,
            StoreError::Exhausted => ErrorCode::Exhausted,
            StoreError::AlreadyExists => ErrorCode::AlreadyExists,
            StoreError::InvalidUpload(_) => ErrorCode::BadRequest,
            StoreError::Database(_)
            | StoreError::Io(_)
            | StoreError::Corrupt(_)
            | StoreError::Entropy(_)
            | StoreError::LockPoisoned => ErrorCode::Internal,
        }
    }
}
