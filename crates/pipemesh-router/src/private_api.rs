//! Replica-to-replica websocket endpoint.
//!
//! `GET /private/api/pipe/{key}` upgrades to a websocket carrying the UI
//! half of the local pipe for `key`. Peers bridging a pipe whose probe end
//! lives here dial this endpoint.

use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pipemesh_core::{End, Pipe};

use crate::reconcile::ReconcilerHandle;
use crate::ws;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub reconciler: ReconcilerHandle,
    /// Cancelled on router shutdown; ends every open socket.
    pub shutdown: CancellationToken,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/private/api/pipe/{key}", get(pipe_socket))
        .with_state(state)
}

/// Serve the private API on `listener` until `state.shutdown` fires.
pub async fn serve(listener: TcpListener, state: ApiState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Private API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// `GET /private/api/pipe/{key}`
async fn pipe_socket(
    Path(key): Path<String>,
    State(state): State<ApiState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let pipe = match state.reconciler.lookup(&key).await {
        Ok(Some(pipe)) => pipe,
        Ok(None) => {
            debug!(key = %key, "Private API request for pipe not held here");
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Private API lookup failed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    upgrade.on_upgrade(move |socket| stream_pipe(key, pipe, socket, state.shutdown))
}

async fn stream_pipe(key: String, pipe: Pipe, socket: WebSocket, shutdown: CancellationToken) {
    debug!(key = %key, "Private API stream opened");
    let half = pipe.half(End::Ui);
    match ws::copy_axum(&pipe, &half, socket, &shutdown).await {
        Ok(()) => debug!(key = %key, "Private API stream closed"),
        Err(e) => warn!(key = %key, error = %e, "Private API stream failed"),
    }
}
