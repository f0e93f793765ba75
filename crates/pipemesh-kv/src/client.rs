//! JSON-valued client with retrying compare-and-swap and prefix watch.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pipemesh_core::RouterConfig;
use pipemesh_core::config::Backoff;

use crate::error::{CasAbort, CasError, KvError};
use crate::store::KvStore;

/// A value written by [`ConsistentClient::cas`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swapped<T> {
    pub value: T,
    /// Modify index of the value that was replaced, 0 if the key was created.
    /// Any version of the key at or below this index predates the write.
    pub replaced_index: u64,
}

/// High-level client over a [`KvStore`]. Values are JSON documents.
#[derive(Clone)]
pub struct ConsistentClient {
    store: Arc<dyn KvStore>,
    cas_attempts: u32,
    cas_retry_delay: Duration,
    long_poll: Duration,
    backoff: Backoff,
}

impl ConsistentClient {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, &RouterConfig::default())
    }

    pub fn with_config(store: Arc<dyn KvStore>, config: &RouterConfig) -> Self {
        Self {
            store,
            cas_attempts: config.cas_attempts.max(1),
            cas_retry_delay: config.cas_retry_delay(),
            long_poll: config.long_poll(),
            backoff: config.watch_backoff(),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Strongly-consistent read of `key`, decoded from JSON.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, KvError> {
        let pair = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| KvError::NotFound(key.to_string()))?;
        decode(key, &pair.value)
    }

    /// Atomically modify `key` through `f`.
    ///
    /// `f` receives the current value (`None` if absent) and returns the
    /// value to store, or a [`CasAbort`]. The write only lands if the key's
    /// version is unchanged since the read; otherwise the whole
    /// read/callback/write cycle is retried, up to the configured number of
    /// attempts. Transport and decode failures use up an attempt; a value that
    /// fails to encode ends the call at once. Returns the value written.
    pub async fn cas<T, E, F>(&self, key: &str, mut f: F) -> Result<Swapped<T>, CasError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnMut(Option<T>) -> Result<T, CasAbort<E>>,
    {
        let mut last_rejection = None;
        for attempt in 0..self.cas_attempts {
            if attempt > 0 && !self.cas_retry_delay.is_zero() {
                tokio::time::sleep(self.cas_retry_delay).await;
            }

            let (current, index) = match self.store.get(key).await {
                Ok(Some(pair)) => match decode::<T>(key, &pair.value) {
                    Ok(value) => (Some(value), pair.modify_index),
                    Err(e) => {
                        warn!(key, attempt, error = %e, "CAS read undecodable value");
                        continue;
                    }
                },
                Ok(None) => (None, 0),
                Err(e) => {
                    warn!(key, attempt, error = %e, "CAS read failed");
                    continue;
                }
            };

            let next = match f(current) {
                Ok(next) => next,
                Err(CasAbort::Fail(e)) => return Err(CasError::Rejected(e)),
                Err(CasAbort::Retry(e)) => {
                    debug!(key, attempt, reason = %e, "CAS callback asked to retry");
                    last_rejection = Some(e);
                    continue;
                }
            };

            let value = match serde_json::to_vec(&next) {
                Ok(value) => value,
                Err(source) => {
                    return Err(CasError::Store(KvError::Encode {
                        key: key.to_string(),
                        source,
                    }));
                }
            };

            match self.store.cas(key, value, index).await {
                Ok(true) => {
                    return Ok(Swapped {
                        value: next,
                        replaced_index: index,
                    });
                }
                Ok(false) => debug!(key, attempt, index, "CAS lost version race, retrying"),
                Err(e) => warn!(key, attempt, error = %e, "CAS write failed"),
            }
        }

        Err(CasError::Exhausted {
            key: key.to_string(),
            attempts: self.cas_attempts,
            last_rejection,
        })
    }

    /// Watch every key under `prefix`, calling `f` with each key, decoded
    /// value and modify index whenever the prefix changes (and once for every
    /// existing key at start). Runs until `f` returns `false` or `done` is
    /// cancelled.
    /// Transport errors back off exponentially and never end the watch.
    pub async fn watch_prefix<T, F, Fut>(&self, prefix: &str, done: &CancellationToken, mut f: F)
    where
        T: DeserializeOwned + Send,
        F: FnMut(String, T, u64) -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        let mut index = 0u64;
        let mut failures = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                () = done.cancelled() => return,
                r = self.store.list(prefix, index, Some(self.long_poll)) => r,
            };

            let list = match result {
                Ok(list) => list,
                Err(e) => {
                    let delay = self.backoff.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        prefix,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Watch failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        () = done.cancelled() => return,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            failures = 0;

            if list.index == index {
                continue;
            }
            // A cursor that goes backwards means the store was reset.
            index = if list.index < index { 0 } else { list.index };

            for pair in list.pairs {
                let value = match decode::<T>(&pair.key, &pair.value) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(key = %pair.key, error = %e, "Skipping undecodable watch entry");
                        continue;
                    }
                };
                if !f(pair.key, value, pair.modify_index).await {
                    debug!(prefix, "Watch callback stopped the watch");
                    return;
                }
            }
        }
    }

    /// Delete every key under `prefix` whose decoded value satisfies `f`.
    /// Returns the number of keys deleted.
    pub async fn delete_selected<T, F>(&self, prefix: &str, mut f: F) -> Result<usize, KvError>
    where
        T: DeserializeOwned,
        F: FnMut(&str, &T) -> bool,
    {
        let list = self.store.list(prefix, 0, None).await?;
        let mut deleted = 0;
        for pair in list.pairs {
            let value: T = decode(&pair.key, &pair.value)?;
            if f(&pair.key, &value) {
                self.store.delete(&pair.key).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

impl fmt::Debug for ConsistentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistentClient")
            .field("cas_attempts", &self.cas_attempts)
            .field("long_poll", &self.long_poll)
            .finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, KvError> {
    serde_json::from_slice(bytes).map_err(|source| KvError::Decode {
        key: key.to_string(),
        source,
    })
}
