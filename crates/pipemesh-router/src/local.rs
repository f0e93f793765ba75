//! In-memory pipe router for single-replica deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use pipemesh_core::{End, Pipe, PipeHalf, PipeId};

use crate::error::PipeError;
use crate::router::PipeRouter;

/// Timing of the local router's garbage collector.
#[derive(Debug, Clone, Copy)]
pub struct LocalRouterConfig {
    /// How often pipes are checked.
    pub gc_interval: Duration,
    /// An end unreferenced for this long closes its pipe.
    pub pipe_timeout: Duration,
    /// A closed pipe is forgotten after this long.
    pub gc_timeout: Duration,
}

impl Default for LocalRouterConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(30),
            pipe_timeout: Duration::from_secs(60),
            gc_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct EndState {
    ref_count: u32,
    last_used: Instant,
}

#[derive(Debug)]
struct LocalPipe {
    pipe: Pipe,
    ui: EndState,
    probe: EndState,
    tombstoned_at: Option<Instant>,
}

impl LocalPipe {
    fn new(now: Instant) -> Self {
        Self {
            pipe: Pipe::new(),
            ui: EndState {
                ref_count: 0,
                last_used: now,
            },
            probe: EndState {
                ref_count: 0,
                last_used: now,
            },
            tombstoned_at: None,
        }
    }

    const fn end_mut(&mut self, end: End) -> &mut EndState {
        match end {
            End::Ui => &mut self.ui,
            End::Probe => &mut self.probe,
        }
    }

    fn tombstone(&mut self, now: Instant) {
        self.pipe.close();
        self.tombstoned_at = Some(now);
    }
}

type PipeTable = Arc<RwLock<HashMap<String, LocalPipe>>>;

/// Pipe router keeping every pipe in this process.
///
/// Both ends always meet locally, so there is no ownership record and no
/// bridging. Pipes whose ends go unused time out and are later forgotten.
pub struct LocalPipeRouter {
    pipes: PipeTable,
    config: LocalRouterConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl LocalPipeRouter {
    pub fn new() -> Self {
        Self::with_config(LocalRouterConfig::default())
    }

    pub fn with_config(config: LocalRouterConfig) -> Self {
        let pipes = PipeTable::default();
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(gc_loop(Arc::clone(&pipes), config, shutdown.clone()));
        Self {
            pipes,
            config,
            shutdown,
            tasks,
        }
    }

    pub const fn config(&self) -> &LocalRouterConfig {
        &self.config
    }
}

impl Default for LocalPipeRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipeRouter for LocalPipeRouter {
    async fn exists(&self, id: &PipeId) -> Result<bool, PipeError> {
        let pipes = self.pipes.read().await;
        Ok(pipes
            .get(&id.key(""))
            .is_some_and(|p| !p.pipe.is_closed()))
    }

    async fn get(&self, id: &PipeId, end: End) -> Result<(Pipe, PipeHalf), PipeError> {
        let key = id.key("");
        let mut pipes = self.pipes.write().await;
        let entry = pipes.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating local pipe");
            LocalPipe::new(Instant::now())
        });
        if entry.pipe.is_closed() {
            return Err(PipeError::Tombstoned(key));
        }
        entry.end_mut(end).ref_count += 1;
        Ok((entry.pipe.clone(), entry.pipe.half(end)))
    }

    async fn release(&self, id: &PipeId, end: End) -> Result<(), PipeError> {
        let key = id.key("");
        let mut pipes = self.pipes.write().await;
        let Some(entry) = pipes.get_mut(&key) else {
            return Err(PipeError::NotFound(key));
        };
        let closed = entry.pipe.is_closed();
        let state = entry.end_mut(end);
        if state.ref_count == 0 {
            return Err(PipeError::OwnershipViolation {
                key,
                end,
                holder: String::new(),
            });
        }
        state.ref_count -= 1;
        if state.ref_count == 0 && !closed {
            state.last_used = Instant::now();
        }
        Ok(())
    }

    async fn delete(&self, id: &PipeId) -> Result<(), PipeError> {
        let mut pipes = self.pipes.write().await;
        if let Some(entry) = pipes.get_mut(&id.key("")) {
            entry.tombstone(Instant::now());
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        for (_, entry) in self.pipes.write().await.drain() {
            entry.pipe.close();
        }
    }
}

async fn gc_loop(pipes: PipeTable, config: LocalRouterConfig, done: CancellationToken) {
    let mut interval = tokio::time::interval(config.gc_interval);
    interval.tick().await; // Skip first immediate tick
    loop {
        tokio::select! {
            biased;
            () = done.cancelled() => return,
            _ = interval.tick() => {}
        }
        let mut pipes = pipes.write().await;
        let now = Instant::now();
        time_out_idle(&mut pipes, now, config.pipe_timeout);
        forget_closed(&mut pipes, now, config.gc_timeout);
    }
}

/// Close open pipes with an end unreferenced for at least `timeout`.
fn time_out_idle(pipes: &mut HashMap<String, LocalPipe>, now: Instant, timeout: Duration) {
    for (key, entry) in pipes.iter_mut() {
        if entry.pipe.is_closed() {
            continue;
        }
        let idle = |end: &EndState| {
            end.ref_count == 0 && now.saturating_duration_since(end.last_used) >= timeout
        };
        if idle(&entry.ui) || idle(&entry.probe) {
            info!(key = %key, "Timing out pipe");
            entry.tombstone(now);
        }
    }
}

/// Drop pipes closed for at least `gc_timeout`.
fn forget_closed(pipes: &mut HashMap<String, LocalPipe>, now: Instant, gc_timeout: Duration) {
    pipes.retain(|_, entry| {
        entry
            .tombstoned_at
            .is_none_or(|at| now.saturating_duration_since(at) < gc_timeout)
    });
}
