//! Bridge connections.
//!
//! When this replica holds a pipe's UI end and a remote replica holds the
//! probe end, a bridge dials the remote's private API and copies between the
//! local pipe and that socket, redialling until stopped.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pipemesh_core::{End, Pipe};

use crate::ws;

/// Websocket URL of `key`'s pipe on the private API at `addr`.
pub fn private_api_url(addr: &str, key: &str) -> String {
    format!("ws://{addr}/private/api/pipe/{}", urlencoding::encode(key))
}

/// A running bridge to a remote replica.
#[derive(Debug)]
pub struct BridgeConnection {
    key: String,
    target: String,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl BridgeConnection {
    /// Start bridging `pipe` to the replica at `target`. Failed dials and
    /// broken streams are retried after `retry`.
    pub fn spawn(key: String, target: String, pipe: Pipe, retry: Duration) -> Self {
        let stop = CancellationToken::new();
        let url = private_api_url(&target, &key);
        let task = tokio::spawn(run(key.clone(), url, pipe, stop.clone(), retry));
        Self {
            key,
            target,
            stop,
            task,
        }
    }

    /// Address of the remote replica holding the probe end.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the bridge loop has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the bridge and wait for its loop to exit. Any open socket is
    /// closed.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(key = %self.key, error = %e, "Bridge task failed");
        }
    }
}

async fn run(key: String, url: String, pipe: Pipe, stop: CancellationToken, retry: Duration) {
    info!(key = %key, url = %url, "Making bridge connection");
    let half = pipe.half(End::Probe);

    loop {
        if pipe.is_closed() {
            debug!(key = %key, "Local pipe closed, ending bridge");
            break;
        }

        let dialed = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            r = tokio_tungstenite::connect_async(url.as_str()) => r,
        };

        match dialed {
            Ok((socket, _)) => {
                debug!(key = %key, "Bridge connected");
                match ws::copy_tungstenite(&pipe, &half, socket, &stop).await {
                    Ok(()) => debug!(key = %key, "Bridge stream ended"),
                    Err(e) => warn!(key = %key, error = %e, "Bridge stream failed"),
                }
            }
            Err(e) => warn!(key = %key, url = %url, error = %e, "Bridge dial failed"),
        }

        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = tokio::time::sleep(retry) => {}
        }
    }

    info!(key = %key, "Bridge connection stopped");
}
