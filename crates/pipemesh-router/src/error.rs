//! Pipe router error types.

use pipemesh_core::End;
use pipemesh_kv::{CasError, KvError};

/// Errors returned by pipe router operations.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("Pipe {0} not found")]
    NotFound(String),

    #[error("Pipe {0} has been deleted")]
    Tombstoned(String),

    /// Another replica holds the requested end.
    #[error("Pipe {key} {end} end is held by {holder}")]
    OwnershipConflict {
        key: String,
        end: End,
        holder: String,
    },

    /// This replica tried to release an end it does not hold.
    #[error("Pipe {key} {end} end is not held here (holder: {holder:?})")]
    OwnershipViolation {
        key: String,
        end: End,
        holder: String,
    },

    #[error("Failed to update pipe {key} after {attempts} attempts")]
    UpdateFailed { key: String, attempts: u32 },

    #[error("KV error: {0}")]
    Kv(#[from] KvError),

    #[error("Failed to bind private API on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Pipe router is shut down")]
    Closed,
}

impl PipeError {
    /// Whether a compare-and-swap should re-read and try again after this
    /// rejection. Only a held end can change hands; every other refusal is
    /// final.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OwnershipConflict { .. })
    }

    /// Collapse a failed compare-and-swap into the error the caller sees.
    /// When attempts ran out on a retryable rejection, that rejection is
    /// reported instead of the bare exhaustion.
    pub(crate) fn from_cas(err: CasError<Self>) -> Self {
        match err {
            CasError::Rejected(e)
            | CasError::Exhausted {
                last_rejection: Some(e),
                ..
            } => e,
            CasError::Exhausted {
                key,
                attempts,
                last_rejection: None,
            } => Self::UpdateFailed { key, attempts },
            CasError::Store(e) => Self::Kv(e),
        }
    }
}
