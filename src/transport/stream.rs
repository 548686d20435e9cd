// ABOUTME: TLS-wrapped TCP transport backend for the hub and its clients
// ABOUTME: Records are a 16-bit big-endian length prefix followed by the frame bytes

use crate::codec::MAX_FRAME;
use crate::transport::{FrameSink, HandleId, Origin, TransportError, TransportEvent};
use bytes::{Buf, Bytes, BytesMut};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, rustls, server};
use tracing::{debug, info, warn};

/// TCP keepalive tuning, matching the original network configuration.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_PROBES: u32 = 4;
const SOCKET_BUFFER: usize = 256 * 1024;

/// Load the hub's certificate chain and private key.
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
    let creds = |path: &Path, reason: String| TransportError::Credentials {
        path: path.display().to_string(),
        reason,
    };

    let cert_file = File::open(cert_path).map_err(|e| creds(cert_path, e.to_string()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| creds(cert_path, e.to_string()))?;
    if certs.is_empty() {
        return Err(creds(cert_path, "no certificates found".to_owned()));
    }

    let key_file = File::open(key_path).map_err(|e| creds(key_path, e.to_string()))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| creds(key_path, e.to_string()))?
        .ok_or_else(|| creds(key_path, "no private key found".to_owned()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| creds(cert_path, e.to_string()))?;
    Ok(Arc::new(config))
}

/// Load the trust anchor clients verify the hub against.
pub fn load_client_config(ca_path: &Path) -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let creds = |reason: String| TransportError::Credentials {
        path: ca_path.display().to_string(),
        reason,
    };

    let ca_file = File::open(ca_path).map_err(|e| creds(e.to_string()))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(ca_file)) {
        let cert = cert.map_err(|e| creds(e.to_string()))?;
        roots.add(cert).map_err(|e| creds(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(creds("no trust anchors found".to_owned()));
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Apply the chat socket profile to a connected stream.
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_PROBES);
    sock.set_tcp_keepalive(&keepalive)?;
    sock.set_recv_buffer_size(SOCKET_BUFFER)?;
    sock.set_send_buffer_size(SOCKET_BUFFER)?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// `buf` carries leftover bytes between calls: parse what is buffered, read
/// more when a frame is still short. Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> io::Result<Option<Bytes>> {
    loop {
        if buf.len() >= 2 {
            let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if len > MAX_FRAME {
                // A stream with a lying prefix cannot be resynchronized.
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame length {len} exceeds limit {MAX_FRAME}"),
                ));
            }
            if buf.len() >= 2 + len {
                buf.advance(2);
                return Ok(Some(buf.split_to(len).freeze()));
            }
        }

        if 0 == reader.read_buf(buf).await? {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-frame",
            ));
        }
    }
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    debug_assert!(frame.len() <= MAX_FRAME);
    let len = u16::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too long for prefix"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// The running TLS listener.
pub struct StreamTransport {
    accept: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl StreamTransport {
    /// Bind the listening socket, then accept and handshake peers until shut
    /// down. Each accepted connection gets its own fan-in task.
    pub fn bind(
        addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let socket = socket2::Socket::new(
            if addr.is_ipv4() {
                socket2::Domain::IPV4
            } else {
                socket2::Domain::IPV6
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(TransportError::Bind)?;
        socket.set_reuse_address(true).map_err(TransportError::Bind)?;
        socket.set_nonblocking(true).map_err(TransportError::Bind)?;
        socket.bind(&addr.into()).map_err(TransportError::Bind)?;
        socket.listen(128).map_err(TransportError::Bind)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener).map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;

        info!(
            addr = %local_addr,
            "listening (TLS 1.2+, 16-bit length-prefixed records)"
        );

        let acceptor = TlsAcceptor::from(tls);
        let accept = tokio::spawn(accept_loop(listener, acceptor, events));
        Ok(StreamTransport { accept, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Dropping the accept task closes the listening socket,
    /// which is the platform-native way to unblock the accept worker.
    pub fn shutdown(self) {
        self.accept.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    events: mpsc::Sender<TransportEvent>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        if let Err(err) = configure_stream(&stream) {
            warn!(%peer, %err, "could not configure socket, dropping connection");
            continue;
        }

        let acceptor = acceptor.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    warn!(%peer, %err, "TLS handshake failed");
                    return;
                }
            };
            let handle = HandleId::next();
            debug!(%peer, %handle, "client connected");

            let (read_half, write_half) = tokio::io::split(tls);
            let connected = TransportEvent::Connected {
                handle,
                peer: peer.to_string(),
                sink: FrameSink::Stream(StreamSink { writer: write_half }),
            };
            if events.send(connected).await.is_err() {
                return;
            }

            fan_in(read_half, handle, &events).await;
            let _ = events.send(TransportEvent::Disconnected { handle }).await;
        });
    }
}

/// Per-connection fan-in: deframe and forward until EOF or error.
async fn fan_in(
    mut reader: ReadHalf<server::TlsStream<TcpStream>>,
    handle: HandleId,
    events: &mpsc::Sender<TransportEvent>,
) {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    loop {
        match read_frame(&mut reader, &mut buf).await {
            Ok(Some(bytes)) => {
                let event = TransportEvent::Frame {
                    origin: Origin::Endpoint(handle),
                    bytes,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(%handle, "peer closed connection");
                return;
            }
            Err(err) => {
                debug!(%handle, %err, "read failed");
                return;
            }
        }
    }
}

/// The write side of one TLS session.
pub struct StreamSink {
    writer: WriteHalf<server::TlsStream<TcpStream>>,
}

impl std::fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink").finish_non_exhaustive()
    }
}

impl StreamSink {
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        write_frame(&mut self.writer, frame).await
    }

    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
