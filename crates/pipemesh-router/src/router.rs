//! Pipe routers.
//!
//! [`PipeRouter`] is the surface the public API uses to hand out pipe
//! halves. [`DistributedPipeRouter`] coordinates ownership across replicas
//! through the KV store. [`LocalPipeRouter`](crate::local::LocalPipeRouter)
//! keeps everything in process for single-replica deployments.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use pipemesh_core::{End, Pipe, PipeHalf, PipeId, RouterConfig, unix_timestamp};
use pipemesh_kv::{CasAbort, ConsistentClient, KvError};

use crate::error::PipeError;
use crate::private_api::{self, ApiState};
use crate::reaper;
use crate::reconcile::{LocalView, Reconciler, ReconcilerHandle};
use crate::record::PipeRecord;

/// Hands out pipe halves by tenant-scoped id.
#[async_trait]
pub trait PipeRouter: Send + Sync {
    /// Whether a live pipe exists. Absent pipes do not exist.
    async fn exists(&self, id: &PipeId) -> Result<bool, PipeError>;

    /// Take a reference on `end` of the pipe, creating the pipe if needed.
    /// Returns the pipe and the half the caller should use.
    async fn get(&self, id: &PipeId, end: End) -> Result<(Pipe, PipeHalf), PipeError>;

    /// Drop a reference taken by [`get`](Self::get).
    async fn release(&self, id: &PipeId, end: End) -> Result<(), PipeError>;

    /// Tombstone the pipe. Every replica closes its local copy.
    async fn delete(&self, id: &PipeId) -> Result<(), PipeError>;

    /// Stop background work and close every local pipe.
    async fn shutdown(&self);
}

/// Shared handle to a router.
pub type SharedPipeRouter = Arc<dyn PipeRouter>;

/// Pipe router coordinating ownership across replicas.
///
/// Each end of a pipe is held by at most one replica, recorded in the KV
/// store. When the two ends live on different replicas, the UI holder
/// bridges its local pipe to the probe holder's private API.
pub struct DistributedPipeRouter {
    client: ConsistentClient,
    prefix: String,
    addr: String,
    reconciler: ReconcilerHandle,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl DistributedPipeRouter {
    /// Bind the private API on the advertised address and start routing.
    pub async fn start(client: ConsistentClient, config: &RouterConfig) -> Result<Self, PipeError> {
        let addr = config.advertise_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| PipeError::Bind {
                addr: addr.clone(),
                source,
            })?;
        Ok(Self::start_on(client, config, listener, addr))
    }

    /// Start routing with the private API on an already bound `listener`,
    /// advertising this replica as `addr`.
    pub fn start_on(
        client: ConsistentClient,
        config: &RouterConfig,
        listener: TcpListener,
        addr: String,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let (actor, reconciler) = Reconciler::new(addr.clone(), config.bridge_retry());

        tasks.spawn(actor.run(shutdown.clone()));

        {
            let client = client.clone();
            let prefix = config.prefix.clone();
            let reconciler = reconciler.clone();
            let done = shutdown.clone();
            tasks.spawn(async move {
                client
                    .watch_prefix(&prefix, &done, |key, record: PipeRecord, index| {
                        let reconciler = reconciler.clone();
                        async move { reconciler.update(key, record, index).await }
                    })
                    .await;
                debug!(prefix = %prefix, "Pipe watch stopped");
            });
        }

        {
            let state = ApiState {
                reconciler: reconciler.clone(),
                shutdown: shutdown.clone(),
            };
            tasks.spawn(async move {
                if let Err(e) = private_api::serve(listener, state).await {
                    error!(error = %e, "Private API terminated");
                }
            });
        }

        if let Some(ttl) = config.tombstone_ttl() {
            tasks.spawn(reaper::run(
                client.clone(),
                config.prefix.clone(),
                ttl,
                config.reap_interval(),
                shutdown.clone(),
            ));
        }

        info!(addr = %addr, prefix = %config.prefix, "Pipe router started");
        Self {
            client,
            prefix: config.prefix.clone(),
            addr,
            reconciler,
            shutdown,
            tasks,
        }
    }

    /// Address this replica advertises in ownership records.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Store key for `id`.
    pub fn key(&self, id: &PipeId) -> String {
        id.key(&self.prefix)
    }

    /// Current local state per key, for diagnostics.
    pub async fn local_state(
        &self,
    ) -> Result<std::collections::HashMap<String, LocalView>, PipeError> {
        self.reconciler.snapshot().await
    }

    fn ensure_running(&self) -> Result<(), PipeError> {
        if self.shutdown.is_cancelled() {
            Err(PipeError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PipeRouter for DistributedPipeRouter {
    async fn exists(&self, id: &PipeId) -> Result<bool, PipeError> {
        self.ensure_running()?;
        match self.client.get::<PipeRecord>(&self.key(id)).await {
            Ok(record) => Ok(record.is_live()),
            Err(KvError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &PipeId, end: End) -> Result<(Pipe, PipeHalf), PipeError> {
        self.ensure_running()?;
        let key = self.key(id);
        info!(key = %key, %end, "Get pipe");

        let swapped = self
            .client
            .cas(&key, |current: Option<PipeRecord>| {
                let mut record = current.unwrap_or_else(|| PipeRecord::new(unix_timestamp()));
                match record.acquire(&key, end, &self.addr) {
                    Ok(_) => Ok(record),
                    Err(e) if e.is_retryable() => Err(CasAbort::Retry(e)),
                    Err(e) => Err(CasAbort::Fail(e)),
                }
            })
            .await
            .map_err(PipeError::from_cas)?;

        let pipe = self
            .reconciler
            .acquire(key, swapped.value, swapped.replaced_index)
            .await?;
        let half = pipe.half(end);
        Ok((pipe, half))
    }

    async fn release(&self, id: &PipeId, end: End) -> Result<(), PipeError> {
        self.ensure_running()?;
        let key = self.key(id);
        info!(key = %key, %end, "Release pipe");

        // Local state follows once the watch delivers the new record.
        self.client
            .cas(&key, |current: Option<PipeRecord>| {
                let Some(mut record) = current else {
                    return Err(CasAbort::Fail(PipeError::NotFound(key.clone())));
                };
                record
                    .release(&key, end, &self.addr)
                    .map_err(CasAbort::Fail)?;
                Ok(record)
            })
            .await
            .map_err(PipeError::from_cas)?;
        Ok(())
    }

    async fn delete(&self, id: &PipeId) -> Result<(), PipeError> {
        self.ensure_running()?;
        let key = self.key(id);
        info!(key = %key, "Delete pipe");

        self.client
            .cas(&key, |current: Option<PipeRecord>| {
                let Some(mut record) = current else {
                    return Err(CasAbort::Fail(PipeError::NotFound(key.clone())));
                };
                record.tombstone(unix_timestamp());
                Ok(record)
            })
            .await
            .map_err(PipeError::from_cas)?;
        Ok(())
    }

    async fn shutdown(&self) {
        info!(addr = %self.addr, "Shutting down pipe router");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl std::fmt::Debug for DistributedPipeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedPipeRouter")
            .field("addr", &self.addr)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
