//! KV client error types.

/// Errors raised by the store transport and the consistent client.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store returned HTTP {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("Failed to decode value of {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode value of {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<reqwest::Error> for KvError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Returned by a compare-and-swap callback to refuse an update.
#[derive(Debug)]
pub enum CasAbort<E> {
    /// Refuse this attempt; the client re-reads and calls back again.
    Retry(E),
    /// Refuse permanently; the client returns immediately.
    Fail(E),
}

/// Failure of [`ConsistentClient::cas`](crate::ConsistentClient::cas).
#[derive(Debug, thiserror::Error)]
pub enum CasError<E> {
    #[error("{0}")]
    Rejected(E),

    /// Every attempt was lost to a version race, a transport error, or a
    /// retryable rejection. `last_rejection` holds the most recent
    /// retryable rejection seen, if any.
    #[error("Failed to update {key} after {attempts} attempts")]
    Exhausted {
        key: String,
        attempts: u32,
        last_rejection: Option<E>,
    },

    /// The new value could not be stored. Nothing was written.
    #[error(transparent)]
    Store(KvError),
}
