//! Ferry Offline Store
//!
//! Holds uploaded payloads under a short code until they are retrieved.
//! A transfer stops being served when its TTL passes or its download
//! limit is reached, whichever comes first; the sweeper then deletes the
//! record and its bytes.

pub mod record;
pub mod store;
pub mod sweeper;

pub use record::{IncomingFile, NewTransfer, StoredItem, TransferRecord};
pub use store::{SqliteStore, StoreError, StoreLimits, TransferStore};
pub use sweeper::OfflineSweeper;
