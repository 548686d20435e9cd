// ABOUTME: Named-pipe transport backend - one shared inbound FIFO, one reply FIFO per client
// ABOUTME: Frames are delimited by write boundaries; every non-empty read is one frame

use crate::codec;
use crate::transport::{Origin, TransportError, TransportEvent};
use bytes::Bytes;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read chunk size on the inbound pipe. Large enough for any legal frame.
const READ_BUF: usize = 8192;

/// Reply pipe path for one user: `<dir>/chat_client_<name>_fifo`.
pub fn client_fifo_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("chat_client_{name}_fifo"))
}

/// Create a FIFO with mode 0666, tolerating one that already exists.
pub fn create_fifo(path: &Path) -> io::Result<()> {
    match mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

/// Only bytes that are safe to embed in a pipe path. Matches the user-name
/// charset, so any registrable name passes.
pub fn pathsafe(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// The running inbound side of the pipe backend.
///
/// Holds the hub's own write end on the inbound pipe so the pipe does not
/// collapse to EOF when the last client closes its write side.
pub struct FifoTransport {
    server_path: PathBuf,
    _keep_open: pipe::Sender,
    reader: JoinHandle<()>,
}

impl FifoTransport {
    /// Create the inbound pipe, open it, and start the fan-in reader.
    pub fn spawn(
        server_path: PathBuf,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        create_fifo(&server_path).map_err(TransportError::Bind)?;

        let receiver = pipe::OpenOptions::new()
            .open_receiver(&server_path)
            .map_err(TransportError::Bind)?;
        // Write side opened after the read side so it cannot block; kept for
        // the lifetime of the hub.
        let keep_open = pipe::OpenOptions::new()
            .open_sender(&server_path)
            .map_err(TransportError::Bind)?;

        info!(path = %server_path.display(), "inbound pipe ready (one frame per write)");

        let reader = tokio::spawn(fan_in(receiver, events));
        Ok(FifoTransport {
            server_path,
            _keep_open: keep_open,
            reader,
        })
    }

    /// Stop reading and unlink the on-disk pipe.
    pub fn shutdown(self) {
        self.reader.abort();
        if let Err(err) = std::fs::remove_file(&self.server_path) {
            debug!(path = %self.server_path.display(), %err, "could not unlink inbound pipe");
        }
    }
}

/// The claimed source of a frame, extractable even when the frame itself
/// fails to decode (unknown type, missing later fields). A source only
/// counts when it is a complete `|`-delimited field.
fn claimed_source(frame: &[u8]) -> Option<&[u8]> {
    let mut fields = frame.split(|&b| b == codec::REQUEST_SEP);
    let _frame_type = fields.next()?;
    let source = fields.next()?;
    // Without a third field the source was cut off by the read, not
    // terminated by a separator.
    fields.next()?;
    Some(source)
}

/// Read frames off the shared inbound pipe and hand them to the hub.
///
/// The pipe carries no connection identity, so the claimed source field is
/// the endpoint: it is extracted here (and re-validated by the router) to
/// give each frame an origin the hub can route replies back to. Full
/// validation stays with the hub, which answers protocol errors with a
/// SYSTEM/ERROR reply; an undecodable frame is still forwarded as long as
/// it names a routable source. Only a sourceless frame has no endpoint to
/// answer and is dropped here.
async fn fan_in(mut receiver: pipe::Receiver, events: mpsc::Sender<TransportEvent>) {
    let mut buf = [0u8; READ_BUF];
    loop {
        let n = match receiver.read(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "inbound pipe read failed");
                continue;
            }
        };

        let frame = &buf[..n];
        let source = match codec::decode_request(frame) {
            Ok(parsed) => parsed.source,
            Err(err) => match claimed_source(frame) {
                Some(source) => {
                    debug!(%err, "forwarding undecodable frame for an error reply");
                    source
                }
                None => {
                    warn!(%err, len = n, "dropping sourceless undecodable frame");
                    continue;
                }
            },
        };
        let source = String::from_utf8_lossy(source).into_owned();
        if !pathsafe(&source) {
            warn!(source = %source, "dropping frame with unroutable source");
            continue;
        }

        let event = TransportEvent::Frame {
            origin: Origin::Name(source),
            bytes: Bytes::copy_from_slice(frame),
        };
        if events.send(event).await.is_err() {
            // Hub is gone; nothing left to feed.
            return;
        }
    }
}

/// The write side of one client's reply pipe.
///
/// The pipe is opened on demand for every frame, exactly like the original
/// broker: a client that has gone away (no reader) turns into an immediate
/// write error instead of a block.
#[derive(Debug)]
pub struct FifoSink {
    path: PathBuf,
}

impl FifoSink {
    pub fn new(dir: &Path, name: &str) -> Self {
        FifoSink {
            path: client_fifo_path(dir, name),
        }
    }

    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut sender = pipe::OpenOptions::new().open_sender(&self.path)?;
        sender.write_all(frame).await
    }

    /// Best-effort removal of the client's pipe, mirroring the original
    /// broker's cleanup on leave and eviction.
    pub fn close(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), %err, "could not unlink client pipe");
        }
    }
}
