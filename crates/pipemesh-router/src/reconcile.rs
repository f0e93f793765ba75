//! Reconciliation of local pipes and bridges against ownership records.
//!
//! One actor task owns every local pipe and bridge. Watch notifications and
//! router calls reach it as [`Command`]s, so local state only ever changes on
//! that task. What the actor should hold for a key is a pure function of the
//! latest record and this replica's address ([`desired`]); [`plan`] turns
//! the difference into [`Effect`]s.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pipemesh_core::Pipe;

use crate::bridge::BridgeConnection;
use crate::error::PipeError;
use crate::record::PipeRecord;

/// Commands queued before the actor applies back-pressure to senders.
const MAILBOX: usize = 256;

/// How long a tombstone seen by the watch keeps refusing acquires. Any
/// acquire racing a delete was written before the tombstone, so it reaches
/// the actor well within this window.
const TOMBSTONE_MEMORY: Duration = Duration::from_secs(600);

/// What this replica holds locally for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalView {
    pub pipe: bool,
    /// Remote replica a bridge is dialling, if any.
    pub bridge_to: Option<String>,
}

impl LocalView {
    pub const fn is_empty(&self) -> bool {
        !self.pipe && self.bridge_to.is_none()
    }

    /// State after applying `effect`.
    pub fn apply(&mut self, effect: &Effect) {
        match effect {
            Effect::OpenPipe => self.pipe = true,
            Effect::ClosePipe => self.pipe = false,
            Effect::StartBridge { target } => self.bridge_to = Some(target.clone()),
            Effect::StopBridge => self.bridge_to = None,
        }
    }
}

/// One change to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenPipe,
    ClosePipe,
    StartBridge { target: String },
    StopBridge,
}

/// Whether a replica at `addr` must bridge this pipe: it holds the UI end
/// and some other replica holds the probe end.
pub fn should_bridge(record: &PipeRecord, addr: &str) -> bool {
    record.is_live()
        && record.ui_addr == addr
        && !record.probe_addr.is_empty()
        && record.ui_addr != record.probe_addr
}

/// Local state a replica at `addr` should hold for `record`.
pub fn desired(record: &PipeRecord, addr: &str) -> LocalView {
    if !record.is_live() || !record.holds_either(addr) {
        return LocalView::default();
    }
    LocalView {
        pipe: true,
        bridge_to: should_bridge(record, addr).then(|| record.probe_addr.clone()),
    }
}

/// Effects that take `current` to [`desired`]. A bridge is never left
/// running without a pipe, and is restarted when its target changes.
pub fn plan(current: &LocalView, record: &PipeRecord, addr: &str) -> Vec<Effect> {
    let want = desired(record, addr);
    let mut effects = Vec::new();

    if current.bridge_to.is_some() && current.bridge_to != want.bridge_to {
        effects.push(Effect::StopBridge);
    }
    if current.pipe && !want.pipe {
        effects.push(Effect::ClosePipe);
    }
    if !current.pipe && want.pipe {
        effects.push(Effect::OpenPipe);
    }
    if let Some(target) = want.bridge_to
        && current.bridge_to.as_deref() != Some(target.as_str())
    {
        effects.push(Effect::StartBridge { target });
    }
    effects
}

/// Messages handled by the reconciliation actor.
#[derive(Debug)]
pub enum Command {
    /// A record observed by the watch at modify index `index`.
    Update {
        key: String,
        record: PipeRecord,
        index: u64,
    },
    /// This replica just wrote `record`, replacing the version at
    /// `replaced_index`. Replies with the local pipe for the key, or
    /// [`PipeError::Tombstoned`] if the watch already saw the key deleted.
    Acquire {
        key: String,
        record: PipeRecord,
        replaced_index: u64,
        reply: oneshot::Sender<Result<Pipe, PipeError>>,
    },
    Lookup {
        key: String,
        reply: oneshot::Sender<Option<Pipe>>,
    },
    Snapshot {
        reply: oneshot::Sender<HashMap<String, LocalView>>,
    },
}

/// Cloneable sender side of the actor's mailbox.
#[derive(Debug, Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<Command>,
}

impl ReconcilerHandle {
    /// Queue a watch notification. Returns `false` once the actor is gone.
    pub async fn update(&self, key: String, record: PipeRecord, index: u64) -> bool {
        self.tx
            .send(Command::Update { key, record, index })
            .await
            .is_ok()
    }

    pub async fn acquire(
        &self,
        key: String,
        record: PipeRecord,
        replaced_index: u64,
    ) -> Result<Pipe, PipeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acquire {
            key,
            record,
            replaced_index,
            reply,
        })
        .await?;
        rx.await.map_err(|_| PipeError::Closed)?
    }

    /// The local pipe for `key`, if this replica holds one.
    pub async fn lookup(&self, key: &str) -> Result<Option<Pipe>, PipeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Lookup {
            key: key.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| PipeError::Closed)
    }

    /// Every key with local state and what is held for it.
    pub async fn snapshot(&self) -> Result<HashMap<String, LocalView>, PipeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| PipeError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), PipeError> {
        self.tx.send(command).await.map_err(|_| PipeError::Closed)
    }
}

/// The actor owning local pipes and bridges.
pub struct Reconciler {
    addr: String,
    bridge_retry: Duration,
    rx: mpsc::Receiver<Command>,
    pipes: HashMap<String, Pipe>,
    bridges: HashMap<String, BridgeConnection>,
    /// Newest record version applied per key with local state. Versions at
    /// or below it are stale.
    versions: HashMap<String, u64>,
    /// Keys the watch has reported deleted, with when they were first seen.
    /// Tombstones are final, so these outlive any local state for the key.
    tombstones: HashMap<String, Instant>,
}

impl Reconciler {
    /// Create the actor for a replica advertising `addr`.
    pub fn new(addr: String, bridge_retry: Duration) -> (Self, ReconcilerHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX);
        let actor = Self {
            addr,
            bridge_retry,
            rx,
            pipes: HashMap::new(),
            bridges: HashMap::new(),
            versions: HashMap::new(),
            tombstones: HashMap::new(),
        };
        (actor, ReconcilerHandle { tx })
    }

    /// Handle commands until `shutdown` fires or every handle is dropped,
    /// then stop all bridges and close all pipes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                c = self.rx.recv() => match c {
                    Some(c) => c,
                    None => break,
                },
            };
            self.handle(command).await;
        }
        self.teardown().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Update { key, record, index } => {
                if !record.is_live() {
                    self.note_tombstone(&key);
                }
                if self.versions.get(&key).is_some_and(|&seen| index <= seen) {
                    debug!(key = %key, index, "Skipping stale record");
                    return;
                }
                self.reconcile(&key, &record).await;
                self.note_version(&key, index);
            }
            Command::Acquire {
                key,
                record,
                replaced_index,
                reply,
            } => {
                if self.tombstones.contains_key(&key) {
                    debug!(key = %key, "Refusing acquire of deleted pipe");
                    let _ = reply.send(Err(PipeError::Tombstoned(key)));
                    return;
                }
                // The watch may already have delivered this write or a later
                // one; only apply the written record if it is newer.
                if !self
                    .versions
                    .get(&key)
                    .is_some_and(|&seen| seen > replaced_index)
                {
                    self.reconcile(&key, &record).await;
                    self.note_version(&key, replaced_index);
                }
                let pipe = self.pipes.entry(key).or_default().clone();
                let _ = reply.send(Ok(pipe));
            }
            Command::Lookup { key, reply } => {
                let _ = reply.send(self.pipes.get(&key).cloned());
            }
            Command::Snapshot { reply } => {
                let keys = self.pipes.keys().chain(self.bridges.keys());
                let snapshot = keys.map(|k| (k.clone(), self.view(k))).collect();
                let _ = reply.send(snapshot);
            }
        }
    }

    fn view(&self, key: &str) -> LocalView {
        LocalView {
            pipe: self.pipes.contains_key(key),
            bridge_to: self.bridges.get(key).map(|b| b.target().to_string()),
        }
    }

    async fn reconcile(&mut self, key: &str, record: &PipeRecord) {
        // A bridge that gave up on its own no longer counts as running.
        if self.bridges.get(key).is_some_and(BridgeConnection::is_finished) {
            if let Some(bridge) = self.bridges.remove(key) {
                bridge.stop().await;
            }
        }

        let effects = plan(&self.view(key), record, &self.addr);
        for effect in effects {
            self.apply(key, effect).await;
        }
    }

    async fn apply(&mut self, key: &str, effect: Effect) {
        match effect {
            Effect::OpenPipe => {
                debug!(key, "Opening local pipe");
                self.pipes.insert(key.to_string(), Pipe::new());
            }
            Effect::ClosePipe => {
                if let Some(pipe) = self.pipes.remove(key) {
                    debug!(key, "Closing local pipe");
                    pipe.close();
                }
            }
            Effect::StartBridge { target } => {
                let Some(pipe) = self.pipes.get(key) else {
                    return;
                };
                let bridge = BridgeConnection::spawn(
                    key.to_string(),
                    target,
                    pipe.clone(),
                    self.bridge_retry,
                );
                self.bridges.insert(key.to_string(), bridge);
            }
            Effect::StopBridge => {
                if let Some(bridge) = self.bridges.remove(key) {
                    bridge.stop().await;
                }
            }
        }
    }

    fn note_version(&mut self, key: &str, index: u64) {
        if self.view(key).is_empty() {
            self.versions.remove(key);
        } else {
            let seen = self.versions.entry(key.to_string()).or_default();
            *seen = (*seen).max(index);
        }
    }

    fn note_tombstone(&mut self, key: &str) {
        if self.tombstones.contains_key(key) {
            return;
        }
        self.tombstones.retain(|_, seen| seen.elapsed() < TOMBSTONE_MEMORY);
        self.tombstones.insert(key.to_string(), Instant::now());
    }

    async fn teardown(&mut self) {
        info!(
            pipes = self.pipes.len(),
            bridges = self.bridges.len(),
            "Reconciler shutting down"
        );
        for (_, bridge) in self.bridges.drain() {
            bridge.stop().await;
        }
        for (_, pipe) in self.pipes.drain() {
            pipe.close();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ME: &str = "10.0.0.1:4444";
    const OTHER: &str = "10.0.0.2:4444";

    fn record(ui: &str, probe: &str) -> PipeRecord {
        PipeRecord {
            created_at: 1,
            ui_addr: ui.to_string(),
            ui_ref_count: u32::from(!ui.is_empty()),
            probe_addr: probe.to_string(),
            probe_ref_count: u32::from(!probe.is_empty()),
            ..PipeRecord::default()
        }
    }

    fn tombstone(ui: &str, probe: &str) -> PipeRecord {
        let mut r = record(ui, probe);
        r.tombstone(2);
        r
    }

    #[test]
    fn bridge_only_from_ui_holder_to_remote_probe() {
        assert!(should_bridge(&record(ME, OTHER), ME));
        assert!(!should_bridge(&record(ME, OTHER), OTHER));
        assert!(!should_bridge(&record(ME, ME), ME));
        assert!(!should_bridge(&record(ME, ""), ME));
        assert!(!should_bridge(&record(OTHER, ME), ME));
        assert!(!should_bridge(&tombstone(ME, OTHER), ME));
    }

    #[test]
    fn desired_state_per_record() {
        assert_eq!(
            desired(&record(ME, OTHER), ME),
            LocalView {
                pipe: true,
                bridge_to: Some(OTHER.to_string())
            }
        );
        assert_eq!(
            desired(&record(OTHER, ME), ME),
            LocalView {
                pipe: true,
                bridge_to: None
            }
        );
        assert!(desired(&record(OTHER, ""), ME).is_empty());
        assert!(desired(&tombstone(ME, ME), ME).is_empty());
    }

    #[test]
    fn probe_moving_restarts_the_bridge() {
        let current = LocalView {
            pipe: true,
            bridge_to: Some(OTHER.to_string()),
        };
        let effects = plan(&current, &record(ME, "10.0.0.3:4444"), ME);
        assert_eq!(
            effects,
            vec![
                Effect::StopBridge,
                Effect::StartBridge {
                    target: "10.0.0.3:4444".to_string()
                }
            ]
        );
    }

    #[test]
    fn tombstone_tears_everything_down() {
        let current = LocalView {
            pipe: true,
            bridge_to: Some(OTHER.to_string()),
        };
        let effects = plan(&current, &tombstone(ME, OTHER), ME);
        assert_eq!(effects, vec![Effect::StopBridge, Effect::ClosePipe]);
    }

    #[test]
    fn matching_state_needs_no_effects() {
        let current = LocalView {
            pipe: true,
            bridge_to: Some(OTHER.to_string()),
        };
        assert!(plan(&current, &record(ME, OTHER), ME).is_empty());
    }

    /// Applying the plan for any record from any local state lands exactly on
    /// the desired state, and a second pass is a no-op.
    #[test]
    fn plans_converge_from_every_state() {
        let addrs = ["", ME, OTHER, "10.0.0.3:4444"];
        let mut records = Vec::new();
        for ui in addrs {
            for probe in addrs {
                records.push(record(ui, probe));
                records.push(tombstone(ui, probe));
            }
        }
        let mut states = vec![LocalView::default()];
        for r in &records {
            states.push(desired(r, ME));
        }
        states.push(LocalView {
            pipe: false,
            bridge_to: Some(OTHER.to_string()),
        });

        for start in &states {
            for r in &records {
                let mut state = start.clone();
                for effect in plan(&state, r, ME) {
                    state.apply(&effect);
                    assert!(
                        state.bridge_to.is_none() || state.pipe || effect == Effect::StopBridge,
                        "bridge without pipe after {effect:?}"
                    );
                }
                assert_eq!(state, desired(r, ME), "from {start:?} for {r:?}");
                assert!(plan(&state, r, ME).is_empty());
            }
        }
    }

    async fn snapshot_of(handle: &ReconcilerHandle, key: &str) -> LocalView {
        handle
            .snapshot()
            .await
            .unwrap()
            .remove(key)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn updates_open_and_close_pipes() {
        let (actor, handle) = Reconciler::new(ME.to_string(), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(actor.run(shutdown.clone()));

        handle.update("k".into(), record(OTHER, ME), 5).await;
        let pipe = handle.lookup("k").await.unwrap().unwrap();
        assert!(snapshot_of(&handle, "k").await.pipe);

        handle.update("k".into(), tombstone(OTHER, ME), 6).await;
        assert!(handle.lookup("k").await.unwrap().is_none());
        assert!(pipe.is_closed());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stale_update_does_not_undo_acquire() {
        let (actor, handle) = Reconciler::new(ME.to_string(), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(actor.run(shutdown.clone()));

        // Written over version 7; the watch then reports version 7 itself.
        let pipe = handle
            .acquire("k".into(), record("", ME), 7)
            .await
            .unwrap();
        handle.update("k".into(), record("", ""), 7).await;
        let held = handle.lookup("k").await.unwrap().unwrap();
        assert!(held.ptr_eq(&pipe));
        assert!(!pipe.is_closed());

        // A newer version without this replica closes it.
        handle.update("k".into(), record("", ""), 9).await;
        assert!(handle.lookup("k").await.unwrap().is_none());
        assert!(pipe.is_closed());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn acquire_after_newer_update_reuses_pipe() {
        let (actor, handle) = Reconciler::new(ME.to_string(), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(actor.run(shutdown.clone()));

        handle.update("k".into(), record("", ME), 8).await;
        let seen = handle.lookup("k").await.unwrap().unwrap();
        let pipe = handle
            .acquire("k".into(), record("", ME), 7)
            .await
            .unwrap();
        assert!(pipe.ptr_eq(&seen));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn acquire_after_tombstone_is_refused() {
        let (actor, handle) = Reconciler::new(ME.to_string(), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(actor.run(shutdown.clone()));

        // Another replica deleted the pipe right after this one wrote over
        // version 0, and the watch got here first.
        handle.update("k".into(), tombstone("", ME), 2).await;
        let err = handle
            .acquire("k".into(), record("", ME), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, PipeError::Tombstoned(ref key) if key == "k"));
        assert!(handle.lookup("k").await.unwrap().is_none());
        assert!(snapshot_of(&handle, "k").await.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn old_tombstones_are_forgotten() {
        let (actor, handle) = Reconciler::new(ME.to_string(), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(actor.run(shutdown.clone()));

        handle.update("old".into(), tombstone("", ""), 2).await;
        handle.snapshot().await.unwrap();
        tokio::time::advance(TOMBSTONE_MEMORY + Duration::from_secs(1)).await;
        // Noting a new tombstone prunes expired ones.
        handle.update("new".into(), tombstone("", ""), 3).await;

        assert!(handle.acquire("old".into(), record("", ME), 2).await.is_ok());
        assert!(handle.acquire("new".into(), record("", ME), 0).await.is_err());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_pipes_and_stops_bridges() {
        let (actor, handle) = Reconciler::new(ME.to_string(), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(actor.run(shutdown.clone()));

        // Nothing listens on port 1, so the bridge keeps redialling.
        handle.update("k".into(), record(ME, "127.0.0.1:1"), 3).await;
        let view = snapshot_of(&handle, "k").await;
        assert_eq!(view.bridge_to.as_deref(), Some("127.0.0.1:1"));
        let pipe = handle.lookup("k").await.unwrap().unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(pipe.is_closed());
        assert!(matches!(handle.lookup("k").await, Err(PipeError::Closed)));
    }
}
