// ABOUTME: Client-side session state machine: connect, register, send, receive, disconnect
// ABOUTME: Thin layer the terminal front-ends consume; transport details stay in here

use crate::codec::{self, CodecError, FrameType};
use crate::transport::TransportError;
use crate::transport::fifo::{client_fifo_path, create_fifo};
use crate::transport::stream::{configure_stream, load_client_config, read_frame, write_frame};
use crate::username::{NameError, SYSTEM_NAME, UserName};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsConnector, client};
use tracing::{debug, info, warn};

/// How long registration may take before the connect attempt is abandoned.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the hub lives.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Named pipes on the local host.
    Pipe {
        server_path: PathBuf,
        client_dir: PathBuf,
    },
    /// TLS over TCP.
    Tls {
        addr: String,
        /// Name the hub's certificate must match.
        server_name: String,
        /// Trust anchor file (PEM).
        ca: PathBuf,
    },
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Registered,
}

/// One decoded hub-to-client frame, owned.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub source: String,
    pub kind: FrameType,
    pub dest: String,
    pub content: Bytes,
}

impl InboundFrame {
    fn from_wire(buf: &[u8]) -> Result<Self, CodecError> {
        let raw = codec::decode_reply(buf)?;
        Ok(InboundFrame {
            source: String::from_utf8_lossy(raw.source).into_owned(),
            kind: raw.frame_type,
            dest: String::from_utf8_lossy(raw.dest).into_owned(),
            content: Bytes::copy_from_slice(raw.content),
        })
    }

    pub fn is_system(&self) -> bool {
        self.source == SYSTEM_NAME
    }
}

/// What the presentation layer consumes.
#[derive(Debug, Clone)]
pub enum Event {
    Frame(InboundFrame),
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// The transport went away underneath us.
    TransportClosed,
    /// The hub refused us with a fatal error.
    Fatal(String),
    /// The user asked to leave.
    UserLeave,
}

/// Failure to establish a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid user name: {0}")]
    InvalidName(#[from] NameError),

    #[error("endpoint unavailable: {0}")]
    Unavailable(#[source] io::Error),

    #[error(transparent)]
    Credentials(#[from] TransportError),

    #[error("invalid server name {0:?}")]
    ServerName(String),

    #[error("registration refused: {0}")]
    Refused(String),

    #[error("connection closed during registration")]
    Closed,

    #[error("timed out waiting for registration")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of an established session operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    Disconnected,

    #[error("invalid outbound frame: {0}")]
    InvalidFrame(#[from] CodecError),

    #[error("private message needs a destination")]
    EmptyDestination,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

enum SessionWriter {
    Pipe(pipe::Sender),
    Tls(Box<WriteHalf<client::TlsStream<TcpStream>>>),
}

struct TransportParts {
    writer: SessionWriter,
    reader: JoinHandle<()>,
    /// Pipe backend only: our own write end on our reply pipe, so reads do
    /// not collapse to EOF while the hub opens and closes its end per frame.
    _keep_open: Option<pipe::Sender>,
}

/// A live connection to the hub.
///
/// Created by [`Session::connect`], which only returns once the hub has
/// acknowledged the JOIN (or refused it). Inbound traffic arrives through
/// [`Session::next_event`]; [`Session::status`] exposes the lifecycle as a
/// watchable signal for the Disconnected transition.
pub struct Session {
    name: UserName,
    endpoint: Endpoint,
    parts: TransportParts,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    pending: VecDeque<Event>,
    state: watch::Sender<SessionState>,
    roster: Vec<String>,
}

impl Session {
    /// Connect, register `name`, and wait for the hub's welcome.
    pub async fn connect(endpoint: Endpoint, name: &str) -> Result<Session, ConnectError> {
        let name = UserName::parse_str(name)?;
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state, _) = watch::channel(SessionState::Connecting);

        let parts = open_transport(&endpoint, &name, events_tx.clone()).await?;
        let mut session = Session {
            name,
            endpoint,
            parts,
            events_tx,
            events_rx,
            pending: VecDeque::new(),
            state,
            roster: Vec::new(),
        };

        session.send_join().await?;
        session.await_welcome().await?;
        let _ = session.state.send(SessionState::Registered);
        info!(user = %session.name, "registered");
        Ok(session)
    }

    pub fn name(&self) -> &UserName {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Lifecycle signal; flips to `Disconnected` when the session dies.
    pub fn status(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The roster as of the last SYSTEM/LIST response.
    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    /// Broadcast to everyone else.
    pub async fn send_broadcast(&mut self, text: &[u8]) -> Result<(), SessionError> {
        self.send_frame(FrameType::Msg, "", text).await
    }

    /// Private message to one user.
    pub async fn send_private(&mut self, to: &str, text: &[u8]) -> Result<(), SessionError> {
        if to.is_empty() {
            return Err(SessionError::EmptyDestination);
        }
        self.send_frame(FrameType::Priv, to, text).await
    }

    /// Ask the hub for the current user list.
    pub async fn request_list(&mut self) -> Result<(), SessionError> {
        self.send_frame(FrameType::List, "", b"").await
    }

    /// Announce departure and drop to Disconnected.
    pub async fn leave(&mut self) -> Result<(), SessionError> {
        let result = self.send_frame(FrameType::Leave, "", b"").await;
        self.disconnect(DisconnectReason::UserLeave);
        result
    }

    /// Next inbound event. `None` once the session is fully closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        let event = match self.pending.pop_front() {
            Some(event) => event,
            None => self.events_rx.recv().await?,
        };

        match &event {
            Event::Frame(frame) if frame.is_system() => match frame.kind {
                FrameType::List => {
                    // An authoritative LIST replaces whatever we had cached.
                    self.roster = frame
                        .content
                        .split(|&b| b == b',')
                        .filter(|part| !part.is_empty())
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect();
                }
                FrameType::Error => {
                    if let Some(reason) = fatal_reason(&frame.content) {
                        self.disconnect(DisconnectReason::Fatal(reason));
                    }
                }
                _ => {}
            },
            Event::Disconnected(_) => {
                let _ = self.state.send(SessionState::Disconnected);
            }
            _ => {}
        }
        Some(event)
    }

    async fn send_join(&mut self) -> Result<(), ConnectError> {
        let wire = codec::encode_request(FrameType::Join, self.name.as_str(), "", b"")
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        self.write_once(&wire).await.map_err(ConnectError::Io)
    }

    async fn await_welcome(&mut self) -> Result<(), ConnectError> {
        let deadline = tokio::time::timeout(WELCOME_TIMEOUT, async {
            loop {
                let Some(event) = self.events_rx.recv().await else {
                    return Err(ConnectError::Closed);
                };
                match event {
                    Event::Frame(frame) if frame.is_system() => match frame.kind {
                        FrameType::Join if frame.dest == self.name.as_str() => return Ok(()),
                        FrameType::Error => {
                            return Err(ConnectError::Refused(
                                String::from_utf8_lossy(&frame.content).into_owned(),
                            ));
                        }
                        // Roster churn racing our registration; keep it for
                        // the consumer.
                        _ => self.pending.push_back(Event::Frame(frame)),
                    },
                    Event::Frame(frame) => self.pending.push_back(Event::Frame(frame)),
                    Event::Disconnected(_) => return Err(ConnectError::Closed),
                }
            }
        });
        deadline.await.map_err(|_| ConnectError::Timeout)?
    }

    /// Local validation happens at encode time: SYSTEM cannot be expressed
    /// through this interface, oversized content and separator bytes in the
    /// destination are rejected before anything touches the wire.
    async fn send_frame(
        &mut self,
        frame_type: FrameType,
        dest: &str,
        content: &[u8],
    ) -> Result<(), SessionError> {
        if self.state() != SessionState::Registered {
            return Err(SessionError::Disconnected);
        }
        let wire = codec::encode_request(frame_type, self.name.as_str(), dest, content)?;

        if let Err(first) = self.write_once(&wire).await {
            // One reconnect attempt, then give up.
            warn!(user = %self.name, err = %first, "write failed, reconnecting");
            match self.reconnect().await {
                Ok(()) => {
                    if let Err(second) = self.write_once(&wire).await {
                        self.disconnect(DisconnectReason::TransportClosed);
                        return Err(SessionError::Io(second));
                    }
                }
                Err(_) => {
                    self.disconnect(DisconnectReason::TransportClosed);
                    return Err(SessionError::Io(first));
                }
            }
        }
        Ok(())
    }

    async fn write_once(&mut self, wire: &Bytes) -> io::Result<()> {
        match &mut self.parts.writer {
            // One write is one frame on the pipe transport.
            SessionWriter::Pipe(sender) => sender.write_all(wire).await,
            SessionWriter::Tls(writer) => write_frame(writer.as_mut(), wire).await,
        }
    }

    /// Tear the transport down, bring it back up, and replay JOIN.
    async fn reconnect(&mut self) -> Result<(), ConnectError> {
        self.parts.reader.abort();
        self.parts = open_transport(&self.endpoint, &self.name, self.events_tx.clone()).await?;
        self.send_join().await?;
        info!(user = %self.name, "reconnected");
        Ok(())
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        if self.state() == SessionState::Disconnected {
            return;
        }
        debug!(user = %self.name, ?reason, "session closed");
        let _ = self.state.send(SessionState::Disconnected);
        self.pending.push_back(Event::Disconnected(reason));
        self.parts.reader.abort();
        if let Endpoint::Pipe { client_dir, .. } = &self.endpoint {
            let path = client_fifo_path(client_dir, self.name.as_str());
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.parts.reader.abort();
        if let Endpoint::Pipe { client_dir, .. } = &self.endpoint {
            let path = client_fifo_path(client_dir, self.name.as_str());
            let _ = std::fs::remove_file(path);
        }
    }
}

/// The hub's registration refusals that end the session.
fn fatal_reason(content: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(content);
    let fatal = text == "name already in use"
        || text == "server is full"
        || text == "name is reserved"
        || text.starts_with("name too ")
        || text.starts_with("name must ")
        || text.starts_with("name may ");
    fatal.then(|| text.into_owned())
}

async fn open_transport(
    endpoint: &Endpoint,
    name: &UserName,
    events: mpsc::Sender<Event>,
) -> Result<TransportParts, ConnectError> {
    match endpoint {
        Endpoint::Pipe {
            server_path,
            client_dir,
        } => open_pipe(server_path, client_dir, name, events).await,
        Endpoint::Tls {
            addr,
            server_name,
            ca,
        } => open_tls(addr, server_name, ca, events).await,
    }
}

async fn open_pipe(
    server_path: &Path,
    client_dir: &Path,
    name: &UserName,
    events: mpsc::Sender<Event>,
) -> Result<TransportParts, ConnectError> {
    let reply_path = client_fifo_path(client_dir, name.as_str());
    create_fifo(&reply_path).map_err(ConnectError::Unavailable)?;

    let receiver = pipe::OpenOptions::new()
        .open_receiver(&reply_path)
        .map_err(ConnectError::Unavailable)?;
    let keep_open = pipe::OpenOptions::new()
        .open_sender(&reply_path)
        .map_err(ConnectError::Unavailable)?;
    // Fails with ENXIO when no hub is reading: exactly the "server is down"
    // signal we want at connect time.
    let sender = pipe::OpenOptions::new()
        .open_sender(server_path)
        .map_err(ConnectError::Unavailable)?;

    let reader = tokio::spawn(pipe_reader(receiver, events));
    Ok(TransportParts {
        writer: SessionWriter::Pipe(sender),
        reader,
        _keep_open: Some(keep_open),
    })
}

/// Every non-empty read off the reply pipe is one frame.
async fn pipe_reader(mut receiver: pipe::Receiver, events: mpsc::Sender<Event>) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match receiver.read(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "reply pipe read failed");
                continue;
            }
        };
        match InboundFrame::from_wire(&buf[..n]) {
            Ok(frame) => {
                if events.send(Event::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Err(err) => warn!(%err, "dropping undecodable frame from hub"),
        }
    }
}

async fn open_tls(
    addr: &str,
    server_name: &str,
    ca: &Path,
    events: mpsc::Sender<Event>,
) -> Result<TransportParts, ConnectError> {
    let tls_config = load_client_config(ca)?;
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(ConnectError::Unavailable)?;
    configure_stream(&tcp)?;

    let dns = ServerName::try_from(server_name.to_owned())
        .map_err(|_| ConnectError::ServerName(server_name.to_owned()))?;
    let tls = TlsConnector::from(tls_config)
        .connect(dns, tcp)
        .await
        .map_err(ConnectError::Io)?;

    let (read_half, write_half) = tokio::io::split(tls);
    let reader = tokio::spawn(tls_reader(read_half, events));
    Ok(TransportParts {
        writer: SessionWriter::Tls(Box::new(write_half)),
        reader,
        _keep_open: None,
    })
}

async fn tls_reader(
    mut reader: ReadHalf<client::TlsStream<TcpStream>>,
    events: mpsc::Sender<Event>,
) {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    loop {
        match read_frame(&mut reader, &mut buf).await {
            Ok(Some(bytes)) => match InboundFrame::from_wire(&bytes) {
                Ok(frame) => {
                    if events.send(Event::Frame(frame)).await.is_err() {
                        return;
                    }
                }
                Err(err) => warn!(%err, "dropping undecodable frame from hub"),
            },
            Ok(None) => {
                let _ = events
                    .send(Event::Disconnected(DisconnectReason::TransportClosed))
                    .await;
                return;
            }
            Err(err) => {
                debug!(%err, "hub connection lost");
                let _ = events
                    .send(Event::Disconnected(DisconnectReason::TransportClosed))
                    .await;
                return;
            }
        }
    }
}
