//! In-memory store transport.
//!
//! A single linearizable map with a global modify index. Blocking lists wake
//! on any write. Shared by every router in a process, it stands in for a
//! Consul cluster in tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::KvError;
use crate::store::{KvList, KvPair, KvStore};

#[derive(Debug)]
pub struct MemoryKv {
    state: Mutex<State>,
    index_tx: watch::Sender<u64>,
    /// Number of upcoming calls that fail with a transport error.
    failures: AtomicU32,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, KvPair>,
    index: u64,
}

impl MemoryKv {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            index_tx,
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Current global modify index.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// Raw value of `key`, bypassing failure injection.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().entries.get(key).map(|p| p.value.clone())
    }

    /// Overwrite `key` unconditionally, bypassing failure injection.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) {
        let mut state = self.lock();
        state.index += 1;
        let index = state.index;
        state.entries.insert(
            key.to_string(),
            KvPair {
                key: key.to_string(),
                value,
                modify_index: index,
            },
        );
        drop(state);
        self.index_tx.send_replace(index);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Every mutation is a single insert or remove, so a poisoned map is
        // still consistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_failure(&self) -> Result<(), KvError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(KvError::Transport("injected failure".into()));
        }
        Ok(())
    }

    fn snapshot(&self, prefix: &str) -> KvList {
        let state = self.lock();
        let pairs = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, p)| p.clone())
            .collect();
        KvList {
            pairs,
            index: state.index,
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, KvError> {
        self.check_failure()?;
        Ok(self.lock().entries.get(key).cloned())
    }

    async fn cas(&self, key: &str, value: Vec<u8>, index: u64) -> Result<bool, KvError> {
        self.check_failure()?;
        let mut state = self.lock();
        let current = state.entries.get(key).map_or(0, |p| p.modify_index);
        if current != index {
            return Ok(false);
        }
        state.index += 1;
        let new_index = state.index;
        state.entries.insert(
            key.to_string(),
            KvPair {
                key: key.to_string(),
                value,
                modify_index: new_index,
            },
        );
        drop(state);
        self.index_tx.send_replace(new_index);
        Ok(true)
    }

    async fn list(
        &self,
        prefix: &str,
        index: u64,
        wait: Option<Duration>,
    ) -> Result<KvList, KvError> {
        self.check_failure()?;
        let Some(wait) = wait else {
            return Ok(self.snapshot(prefix));
        };

        let mut rx = self.index_tx.subscribe();
        let _ = tokio::time::timeout(wait, rx.wait_for(|current| *current > index)).await;
        Ok(self.snapshot(prefix))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.check_failure()?;
        let mut state = self.lock();
        if state.entries.remove(key).is_some() {
            state.index += 1;
            let index = state.index;
            drop(state);
            self.index_tx.send_replace(index);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_with_zero_index_creates_once() {
        let kv = MemoryKv::new();
        assert!(kv.cas("k", b"1".to_vec(), 0).await.unwrap());
        assert!(!kv.cas("k", b"2".to_vec(), 0).await.unwrap());
        assert_eq!(kv.raw("k").unwrap(), b"1");
    }

    #[tokio::test]
    async fn cas_requires_current_index() {
        let kv = MemoryKv::new();
        kv.cas("k", b"1".to_vec(), 0).await.unwrap();
        let pair = kv.get("k").await.unwrap().unwrap();

        assert!(kv.cas("k", b"2".to_vec(), pair.modify_index).await.unwrap());
        assert!(!kv.cas("k", b"3".to_vec(), pair.modify_index).await.unwrap());
        assert_eq!(kv.raw("k").unwrap(), b"2");
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let kv = MemoryKv::new();
        kv.put_raw("a/1", b"x".to_vec());
        kv.put_raw("a/2", b"y".to_vec());
        kv.put_raw("b/1", b"z".to_vec());

        let list = kv.list("a/", 0, None).await.unwrap();
        let keys: Vec<_> = list.pairs.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert_eq!(list.index, 3);
    }

    #[tokio::test]
    async fn blocking_list_wakes_on_write() {
        let kv = std::sync::Arc::new(MemoryKv::new());
        kv.put_raw("a/1", b"x".to_vec());
        let index = kv.index();

        let waiter = {
            let kv = std::sync::Arc::clone(&kv);
            tokio::spawn(async move { kv.list("a/", index, Some(Duration::from_secs(5))).await })
        };
        tokio::task::yield_now().await;
        kv.put_raw("a/2", b"y".to_vec());

        let list = waiter.await.unwrap().unwrap();
        assert_eq!(list.pairs.len(), 2);
        assert!(list.index > index);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_list_times_out_unchanged() {
        let kv = MemoryKv::new();
        kv.put_raw("a/1", b"x".to_vec());
        let index = kv.index();

        let list = kv.list("a/", index, Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(list.index, index);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let kv = MemoryKv::new();
        kv.fail_next(2);
        assert!(kv.get("k").await.is_err());
        assert!(kv.get("k").await.is_err());
        assert!(kv.get("k").await.unwrap().is_none());
    }
}
