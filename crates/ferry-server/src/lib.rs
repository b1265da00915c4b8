//! Ferry Server
//!
//! HTTP surface of the offline store, plus the wiring used by the
//! `ferry-server` binary to run it next to the signaling relay.

pub mod api;
pub mod error;

pub use api::{build_router, AppState};
pub use error::ApiError;
