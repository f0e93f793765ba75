//! In-process bidirectional pipes.
//!
//! A [`Pipe`] has two halves. Bytes written to one half are read from the
//! other. The UI end always maps to the first half and the probe end to the
//! second, on every replica.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::end::End;

/// Bytes buffered in each direction before writers wait for readers.
const PIPE_BUFFER: usize = 64 * 1024;

/// A bidirectional byte pipe shared by cheap clones.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<Inner>,
}

struct Inner {
    first: PipeHalf,
    second: PipeHalf,
    closed: CancellationToken,
}

/// One half of a [`Pipe`].
///
/// Clones share the same underlying stream; concurrent readers of one half
/// take turns on a lock.
#[derive(Clone)]
pub struct PipeHalf {
    reader: Arc<Mutex<ReadHalf<DuplexStream>>>,
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    closed: CancellationToken,
}

impl Pipe {
    pub fn new() -> Self {
        let closed = CancellationToken::new();
        let (a, b) = tokio::io::duplex(PIPE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                first: PipeHalf::new(a, closed.clone()),
                second: PipeHalf::new(b, closed.clone()),
                closed,
            }),
        }
    }

    /// Both halves, first then second.
    pub fn ends(&self) -> (PipeHalf, PipeHalf) {
        (self.inner.first.clone(), self.inner.second.clone())
    }

    /// The half held by callers of `end`.
    pub fn half(&self, end: End) -> PipeHalf {
        match end {
            End::Ui => self.inner.first.clone(),
            End::Probe => self.inner.second.clone(),
        }
    }

    /// Close the pipe. Pending and future reads on either half return EOF.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the pipe is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Whether `self` and `other` are handles to the same pipe.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PipeHalf {
    fn new(stream: DuplexStream, closed: CancellationToken) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            closed,
        }
    }

    /// Read bytes written to the opposite half. Returns `Ok(0)` once the pipe
    /// is closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Ok(0),
            n = reader.read(buf) => n,
        }
    }

    /// Write all of `data` for the opposite half to read.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
            }
            r = writer.write_all(data) => r,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for PipeHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeHalf")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
