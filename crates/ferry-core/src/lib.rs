//! Ferry Core - Shared types, transfer codes, and configuration
//!
//! This crate contains the foundational types used across all Ferry components.
//! It has no dependencies on networking or storage code.

pub mod code;
pub mod config;
pub mod error;
pub mod types;

pub use code::{CodeError, generate_code, generate_unique_code, normalize_code, validate_code};
pub use config::{ClientConfig, Config, ConfigError, OfflineConfig, RoomConfig, ServerConfig};
pub use error::*;
pub use types::*;

/// Length of a transfer code in characters
pub const CODE_LENGTH: usize = 6;

/// Maximum age of a signaling room before it stops being visible (30 minutes)
pub const ROOM_MAX_AGE_SECS: u64 = 30 * 60;

/// Interval between room expiry sweeps (5 minutes)
pub const ROOM_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

/// Lifetime of an offline transfer (24 hours)
pub const OFFLINE_TTL_SECS: u64 = 24 * 60 * 60;

/// Interval between offline store sweeps (1 hour)
pub const OFFLINE_SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Default download limit for an offline transfer
pub const DEFAULT_MAX_DOWNLOADS: u32 = 10;

/// Time a client waits for the peer connection to be established
pub const ESTABLISH_TIMEOUT_SECS: u64 = 15;
