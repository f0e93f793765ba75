//! Copying between a pipe half and a websocket.
//!
//! Data travels as binary frames. Both the private API (axum sockets) and
//! bridge connections (tungstenite sockets) run the same copy loop through a
//! small frame adapter.

use std::fmt;
use std::time::Duration;

use axum::extract::ws::{self as axum_ws, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use pipemesh_core::{Pipe, PipeHalf};

/// Largest chunk read from a pipe half into one frame.
const READ_CHUNK: usize = 32 * 1024;

/// How long the closing handshake may take before the socket is dropped.
/// A peer that stopped reading never acknowledges the close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that end a copy abnormally.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("Pipe I/O failed: {0}")]
    Pipe(#[from] std::io::Error),

    #[error("Websocket failed: {0}")]
    Socket(String),
}

/// A websocket frame reduced to what the copy loop cares about.
#[derive(Debug)]
pub enum Frame {
    Data(Bytes),
    Close,
    Control,
}

/// Copy bytes both ways between `half` and a websocket until one side ends
/// or `cancel` fires. Only socket and pipe I/O failures are errors. The
/// socket is closed on return, giving up on the close after [`CLOSE_TIMEOUT`].
pub async fn copy_frames<Si, St, SE, RE>(
    pipe: &Pipe,
    half: &PipeHalf,
    mut sink: Si,
    mut stream: St,
    cancel: &CancellationToken,
) -> Result<(), CopyError>
where
    Si: Sink<Bytes, Error = SE> + Unpin,
    St: Stream<Item = Result<Frame, RE>> + Unpin,
    SE: fmt::Display,
    RE: fmt::Display,
{
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => Ok(()),
        () = pipe.closed() => Ok(()),
        r = pump_out(half, &mut sink) => r,
        r = pump_in(half, &mut stream) => r,
    };
    // Writes fail once the pipe closes; that is the same as a clean end.
    let result = match result {
        Err(CopyError::Pipe(_)) if pipe.is_closed() => Ok(()),
        other => other,
    };

    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        tracing::debug!("Websocket close timed out, dropping socket");
    }
    result
}

/// Pipe half to socket. Returns once the pipe reports EOF.
async fn pump_out<Si, SE>(half: &PipeHalf, sink: &mut Si) -> Result<(), CopyError>
where
    Si: Sink<Bytes, Error = SE> + Unpin,
    SE: fmt::Display,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = half.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.send(Bytes::copy_from_slice(&buf[..n]))
            .await
            .map_err(|e| CopyError::Socket(e.to_string()))?;
    }
}

/// Socket to pipe half. Returns on a close frame or end of stream.
async fn pump_in<St, RE>(half: &PipeHalf, stream: &mut St) -> Result<(), CopyError>
where
    St: Stream<Item = Result<Frame, RE>> + Unpin,
    RE: fmt::Display,
{
    while let Some(frame) = stream.next().await {
        match frame.map_err(|e| CopyError::Socket(e.to_string()))? {
            Frame::Data(data) => half.write_all(&data).await?,
            Frame::Close => return Ok(()),
            Frame::Control => {}
        }
    }
    Ok(())
}

/// Run [`copy_frames`] over a tungstenite client socket.
pub async fn copy_tungstenite<S>(
    pipe: &Pipe,
    half: &PipeHalf,
    socket: WebSocketStream<S>,
    cancel: &CancellationToken,
) -> Result<(), CopyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = socket.split();
    let sink = sink.with(|data: Bytes| {
        future::ready(Ok::<_, tungstenite::Error>(Message::Binary(data)))
    });
    let stream = stream.map(|msg| match msg {
        Ok(Message::Binary(data)) => Ok(Frame::Data(data)),
        Ok(Message::Text(text)) => {
            Ok(Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())))
        }
        Ok(Message::Close(_))
        | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
            Ok(Frame::Close)
        }
        Ok(_) => Ok(Frame::Control),
        Err(e) => Err(e),
    });
    copy_frames(pipe, half, sink, stream, cancel).await
}

/// Run [`copy_frames`] over an upgraded axum socket.
pub async fn copy_axum(
    pipe: &Pipe,
    half: &PipeHalf,
    socket: WebSocket,
    cancel: &CancellationToken,
) -> Result<(), CopyError> {
    let (sink, stream) = socket.split();
    let sink = sink.with(|data: Bytes| {
        future::ready(Ok::<_, axum::Error>(axum_ws::Message::Binary(data)))
    });
    let stream = stream.map(|msg| match msg {
        Ok(axum_ws::Message::Binary(data)) => Ok(Frame::Data(data)),
        Ok(axum_ws::Message::Text(text)) => {
            Ok(Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())))
        }
        Ok(axum_ws::Message::Close(_)) => Ok(Frame::Close),
        Ok(_) => Ok(Frame::Control),
        Err(e) => Err(e),
    });
    copy_frames(pipe, half, sink, stream, cancel).await
}
