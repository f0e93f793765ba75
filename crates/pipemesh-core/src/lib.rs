//! `pipemesh` Core Library
//!
//! Shared functionality for `pipemesh` components:
//! - Pipe ends and tenant-scoped pipe identifiers
//! - In-process bidirectional pipes
//! - Router configuration and log setup
//! - Common error types

pub mod config;
pub mod end;
pub mod error;
pub mod pipe;
pub mod tracing_init;

pub use config::RouterConfig;
pub use end::{End, PipeId};
pub use error::{Error, Result};
pub use pipe::{Pipe, PipeHalf};
pub use tracing_init::{LogConfig, LogFormat};

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as a Unix timestamp (seconds since epoch).
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
