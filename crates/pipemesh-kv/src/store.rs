//! Raw store transport.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::KvError;

/// A stored key with its raw value and modify index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Store version of this key's last write. Never 0 for a stored key.
    pub modify_index: u64,
}

/// Result of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct KvList {
    pub pairs: Vec<KvPair>,
    /// Cursor to pass to the next blocking list.
    pub index: u64,
}

/// Linearizable key/value store transport.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Strongly-consistent read. `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError>;

    /// Write `value` only if the key's modify index equals `index`.
    /// An `index` of 0 succeeds only if the key does not exist.
    async fn cas(&self, key: &str, value: Vec<u8>, index: u64) -> Result<bool, KvError>;

    /// List every key under `prefix`. When `wait` is set, block until the
    /// store's index moves past `index` or `wait` elapses.
    async fn list(&self, prefix: &str, index: u64, wait: Option<Duration>)
    -> Result<KvList, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}
