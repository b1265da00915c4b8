//! HTTP API for offline transfers
//!
//! - `POST /api/upload` - Store a payload, returns its code
//! - `GET /api/info/:code` - What a code refers to (offline, online, ...)
//! - `GET /api/receive/:code` - Retrieve a payload, consuming a download
//! - `GET /api/download/:code/:item_id` - Stream one stored file
//! - `GET /api/status/:code` - Download counters and timestamps
//! - `GET /api/health` - Liveness

pub mod transfers;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use ferry_core::{ErrorCode, OfflineConfig, PayloadKind};
use ferry_signal::RoomRegistry;
use ferry_store::TransferStore;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Offline transfers
    pub store: Arc<dyn TransferStore>,
    /// Live signaling rooms, consulted by `info`
    pub rooms: Arc<dyn RoomRegistry>,
    pub config: Arc<OfflineConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TransferStore>,
        rooms: Arc<dyn RoomRegistry>,
        config: OfflineConfig,
    ) -> Self {
        Self {
            store,
            rooms,
            config: Arc::new(config),
        }
    }

    /// Run a store operation on the blocking pool. Every store call takes
    /// the database lock and may touch the disk.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TransferStore) -> Result<T, ApiError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    }
}

/// What a code currently refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Offline,
    Online,
    Unknown,
    Expired,
    Exhausted,
}

/// JSON body of every API response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_type: Option<TransferType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Default for Envelope<T> {
    fn default() -> Self {
        Self {
            success: false,
            message: None,
            transfer_type: None,
            code: None,
            error: None,
            data: None,
        }
    }
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - browsers on any origin may use the API
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upload_limit = usize::try_from(state.config.max_upload_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/api/upload",
            post(transfers::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/info/:code", get(transfers::info))
        .route("/api/receive/:code", get(transfers::receive))
        .route("/api/download/:code/:item_id", get(transfers::download))
        .route("/api/status/:code", get(transfers::status))
        .route("/api/health", get(health_check))
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Features {
    webrtc: bool,
    offline: bool,
    file_types: Vec<PayloadKind>,
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let features = Features {
        webrtc: true,
        offline: true,
        file_types: vec![
            PayloadKind::File,
            PayloadKind::Text,
            PayloadKind::Screen,
            PayloadKind::Video,
        ],
    };

    let transfers = state
        .with_store(|store| Ok(store.len()?))
        .await
        .unwrap_or(0);

    Json(serde_json::json!({
        "success": true,
        "message": "Ferry server is running",
        "timestamp": Utc::now(),
        "rooms": state.rooms.len(),
        "transfers": transfers,
        "features": features,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_skips_empty_fields() {
        let body = serde_json::to_value(Envelope::ok(serde_json::json!({"x": 1}))).unwrap();
        assert_eq!(body, serde_json::json!({"success": true, "data": {"x": 1}}));
    }

    #[test]
    fn test_transfer_type_names() {
        assert_eq!(
            serde_json::to_string(&TransferType::Exhausted).unwrap(),
            "\"exhausted\""
        );
    }
}
