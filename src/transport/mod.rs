// ABOUTME: Transport abstraction shared by the two interchangeable backends
// ABOUTME: Both move opaque byte frames between the hub and many client endpoints

pub mod fifo;
pub mod stream;

use bytes::Bytes;
use std::fmt;
use std::io;
use thiserror::Error;

/// Opaque reference to one writable client endpoint.
///
/// Allocated by the hub, resolved by the transport. Never reused for a
/// different stream connection; the pipe backend keeps a stable id per user
/// name instead (the pipe path *is* the endpoint there).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub const fn from_raw(raw: u64) -> Self {
        HandleId(raw)
    }

    /// Allocate a process-unique handle.
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an inbound frame came from.
///
/// Stream connections have a connection identity assigned at accept time;
/// the shared inbound pipe only carries the claimed source name, so the pipe
/// backend identifies endpoints by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Endpoint(HandleId),
    Name(String),
}

/// Events a backend feeds into the hub's fan-in.
#[derive(Debug)]
pub enum TransportEvent {
    /// A new stream peer completed its handshake. Carries the write side.
    Connected {
        handle: HandleId,
        peer: String,
        sink: FrameSink,
    },
    /// One inbound frame, already stripped of transport framing.
    Frame { origin: Origin, bytes: Bytes },
    /// A stream peer went away (EOF or read error).
    Disconnected { handle: HandleId },
}

/// The write side of one delivery handle.
///
/// Owned by exactly one writer task; `send` transmits a single already
/// encoded frame with whatever record framing the backend uses.
#[derive(Debug)]
pub enum FrameSink {
    Fifo(fifo::FifoSink),
    Stream(stream::StreamSink),
}

impl FrameSink {
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match self {
            FrameSink::Fifo(sink) => sink.send(frame).await,
            FrameSink::Stream(sink) => sink.send(frame).await,
        }
    }

    /// Release the endpoint. Best-effort; errors are not interesting to the
    /// caller at teardown.
    pub async fn close(&mut self) {
        match self {
            FrameSink::Fifo(sink) => sink.close(),
            FrameSink::Stream(sink) => sink.close().await,
        }
    }
}

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The inbound endpoint (pipe or listening socket) could not be opened.
    /// Fatal for the hub.
    #[error("failed to open inbound endpoint: {0}")]
    Bind(#[source] io::Error),

    /// TLS key material could not be loaded. Fatal for the hub.
    #[error("failed to load credentials from {path}: {reason}")]
    Credentials { path: String, reason: String },

    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}
