//! Host transport
//!
//! Carries host-controller-interface bytes between the DUT process (the
//! host) and the in-process controller adapter. The production shape is a
//! TCP server the DUT dials into via its `--bt-dev=host:port` flag; an
//! in-memory pipe variant lets tests play the host side directly.
//!
//! Bytes are forwarded opaquely. Framing and interpretation belong to the
//! protocol engine on either end.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CHANNEL_DEPTH: usize = 64;
const READ_CHUNK: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable at {endpoint}: {reason}")]
    Unavailable { endpoint: String, reason: String },

    #[error("Transport closed")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Where the DUT reaches its controller: the value of `--bt-dev=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEndpoint {
    pub host: String,
    pub port: u16,
}

impl HciEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl fmt::Display for HciEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Bytes written by the host, read by the controller adapter.
pub struct HostSource {
    rx: mpsc::Receiver<Bytes>,
}

impl HostSource {
    /// Next chunk from the host, or `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Bytes written by the controller adapter towards the host.
#[derive(Clone)]
pub struct HostSink {
    tx: mpsc::Sender<Bytes>,
}

impl HostSink {
    pub async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.tx.send(bytes).await.map_err(|_| TransportError::Closed)
    }
}

/// An open host transport. Owns the background task that shuttles bytes
/// between the host connection and the source/sink channel pair.
pub struct HostTransport {
    description: String,
    local_addr: Option<SocketAddr>,
    source: Option<HostSource>,
    sink: HostSink,
    task: Option<JoinHandle<()>>,
}

impl HostTransport {
    /// Bind a TCP server at `endpoint`. Port 0 picks an ephemeral port; the
    /// bound port is available from [`HostTransport::local_addr`]. Binding
    /// failures (e.g. the port is already in use) surface as
    /// [`TransportError::Unavailable`] before anything else is started.
    pub async fn open_tcp_server(endpoint: &HciEndpoint) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| TransportError::Unavailable {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let (from_host_tx, from_host_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (to_host_tx, to_host_rx) = mpsc::channel(CHANNEL_DEPTH);
        let task = tokio::spawn(serve_tcp(listener, from_host_tx, to_host_rx));

        log::debug!("host transport listening on {}", local_addr);
        Ok(Self {
            description: format!("tcp-server:{}", local_addr),
            local_addr: Some(local_addr),
            source: Some(HostSource { rx: from_host_rx }),
            sink: HostSink { tx: to_host_tx },
            task: Some(task),
        })
    }

    /// An in-memory transport. The returned stream is the host's end.
    pub fn pipe() -> (Self, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(READ_CHUNK * 4);
        (Self::from_stream(ours, "pipe"), theirs)
    }

    /// Wrap an already-connected byte stream.
    pub fn from_stream<S>(stream: S, description: &str) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (from_host_tx, from_host_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (to_host_tx, mut to_host_rx) = mpsc::channel(CHANNEL_DEPTH);
        let task = tokio::spawn(async move {
            pump(stream, &from_host_tx, &mut to_host_rx).await;
        });
        Self {
            description: description.to_string(),
            local_addr: None,
            source: Some(HostSource { rx: from_host_rx }),
            sink: HostSink { tx: to_host_tx },
            task: Some(task),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Hand the read end to its consumer. Only one consumer may own it.
    pub fn take_source(&mut self) -> Option<HostSource> {
        self.source.take()
    }

    pub fn sink(&self) -> HostSink {
        self.sink.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stop the background task and release the socket. Closing twice is
    /// a no-op.
    pub async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // A cancelled JoinError is the expected outcome here.
            let _ = task.await;
            log::debug!("host transport {} closed", self.description);
        }
    }
}

impl Drop for HostTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Serve one host connection at a time; when a host disconnects the next
/// one may dial in. Bytes queued for the host while none is connected are
/// held until one arrives.
async fn serve_tcp(
    listener: TcpListener,
    from_host_tx: mpsc::Sender<Bytes>,
    mut to_host_rx: mpsc::Receiver<Bytes>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("host connected from {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    log::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                if !pump(stream, &from_host_tx, &mut to_host_rx).await {
                    return;
                }
                log::debug!("host {} disconnected", peer);
            }
            Err(e) => {
                log::warn!("Failed to accept host connection: {}", e);
                return;
            }
        }
    }
}

/// Shuttle bytes until the stream ends. Returns `false` once either
/// channel is gone and there is nothing left to serve.
async fn pump<S>(
    stream: S,
    from_host_tx: &mpsc::Sender<Bytes>,
    to_host_rx: &mut mpsc::Receiver<Bytes>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return true,
                Ok(n) => {
                    if from_host_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        return false;
                    }
                }
                Err(e) => {
                    log::warn!("Host read failed: {}", e);
                    return true;
                }
            },
            outbound = to_host_rx.recv() => match outbound {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        log::warn!("Host write failed: {}", e);
                        return true;
                    }
                }
                None => return false,
            },
        }
    }
}
