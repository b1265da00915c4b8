//! Offline sweeper - background expiry of stored transfers
//!
//! Periodically deletes transfers whose TTL has passed or whose download
//! limit is used up, together with their payload bytes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ferry_core::OfflineConfig;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::store::{StoreError, TransferStore};

/// Background sweeper for the offline store
pub struct OfflineSweeper {
    store: Arc<dyn TransferStore>,
    interval: Duration,
}

impl OfflineSweeper {
    pub fn new(store: Arc<dyn TransferStore>, config: &OfflineConfig) -> Self {
        Self::with_interval(store, config.sweep_interval())
    }

    /// Create with a custom interval
    pub fn with_interval(store: Arc<dyn TransferStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run the sweep loop (call from a tokio task)
    pub async fn run_loop(self) {
        let mut tick = interval(self.interval);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tick.tick().await;

            let store = Arc::clone(&self.store);
            match tokio::task::spawn_blocking(move || store.sweep_expired(Utc::now())).await {
                Ok(Ok(removed)) => debug!("Offline sweep removed {} transfers", removed),
                Ok(Err(e)) => error!("Offline sweep error: {}", e),
                Err(e) => error!("Offline sweep task failed: {}", e),
            }
        }
    }

    /// Run a single sweep at `now`
    pub fn sweep_now(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.store.sweep_expired(now)?;
        if removed > 0 {
            info!("Offline sweep removed {} transfers", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NewTransfer;
    use crate::store::{SqliteStore, StoreLimits};
    use chrono::Duration as ChronoDuration;
    use ferry_core::PayloadKind;

    fn text_upload() -> NewTransfer {
        NewTransfer {
            kind: PayloadKind::Text,
            text_content: Some("later".into()),
            files: Vec::new(),
        }
    }

    #[test]
    fn test_sweep_now() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TransferStore> =
            Arc::new(SqliteStore::in_memory(dir.path(), StoreLimits::default()).unwrap());
        let now = Utc::now();
        store.put("SWP001", text_upload(), now).unwrap();

        let sweeper = OfflineSweeper::new(Arc::clone(&store), &OfflineConfig::default());
        assert_eq!(sweeper.sweep_now(now).unwrap(), 0);
        assert_eq!(sweeper.sweep_now(now + ChronoDuration::hours(25)).unwrap(), 1);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_run_loop_sweeps_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let limits = StoreLimits {
            ttl: Duration::ZERO,
            ..StoreLimits::default()
        };
        let store: Arc<dyn TransferStore> =
            Arc::new(SqliteStore::in_memory(dir.path(), limits).unwrap());
        store
            .put("SWP002", text_upload(), Utc::now() - ChronoDuration::seconds(5))
            .unwrap();

        let sweeper = OfflineSweeper::with_interval(Arc::clone(&store), Duration::from_millis(50));
        let task = tokio::spawn(sweeper.run_loop());

        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if store.is_empty().unwrap() {
                break;
            }
        }
        assert!(store.is_empty().unwrap());
        task.abort();
    }
}
