//! TCP transport: stream endpoints and the accept/read event loop.

use crate::{
    ConnIdGenerator, ConnectionHandler, Endpoint, InboundConn, TransportError, TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// A TCP stream endpoint.
///
/// Reader and writer halves sit behind separate locks so the two relay
/// directions never contend: each direction has exactly one reader and one
/// writer. Close cancels the shutdown token, which wakes a blocked read with
/// EOF, then shuts the write half down.
pub struct TcpEndpoint {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local_addr: String,
    peer_addr: String,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl TcpEndpoint {
    pub fn new(stream: TcpStream) -> TransportResult<Self> {
        let local_addr = stream.local_addr()?.to_string();
        let peer_addr = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            peer_addr,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    async fn read_chunk(&self) -> TransportResult<Option<Bytes>> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

impl fmt::Debug for TcpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpEndpoint")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn send(&self, data: &[u8]) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(data.len())
    }

    async fn recv(&self, timeout: Option<Duration>) -> TransportResult<Option<Bytes>> {
        if self.is_closed() {
            return Ok(None);
        }
        let read = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, self.read_chunk()).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                },
                None => self.read_chunk().await,
            }
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            result = read => result,
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn peer_addr(&self) -> String {
        self.peer_addr.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Open an outbound TCP endpoint to `host:port`.
pub(crate) async fn dial(addr: &str) -> TransportResult<Arc<dyn Endpoint>> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Arc::new(TcpEndpoint::new(stream)?))
}

/// TCP listener: accepts connections, issues [`crate::ConnId`]s and drives
/// the handler's accept/receive/close events.
pub struct TcpBridgeListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    ids: ConnIdGenerator,
}

impl TcpBridgeListener {
    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            ids: ConnIdGenerator::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self, handler: Arc<dyn ConnectionHandler>) -> TransportResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let id = self.ids.next_id();
                    let endpoint: Arc<dyn Endpoint> = match TcpEndpoint::new(stream) {
                        Ok(ep) => Arc::new(ep),
                        Err(e) => {
                            warn!("dropping connection from {}: {}", peer_addr, e);
                            continue;
                        }
                    };
                    let conn = InboundConn { id, endpoint };
                    debug!(conn = %id, peer = %peer_addr, "accepted TCP connection");

                    // The accept event and the read loop run on separate
                    // tasks, so the first message can arrive while the
                    // handler is still registering the connection.
                    let accept_handler = handler.clone();
                    let accept_conn = conn.clone();
                    tokio::spawn(async move {
                        accept_handler.on_accept(accept_conn).await;
                    });

                    let read_handler = handler.clone();
                    tokio::spawn(async move {
                        read_loop(conn, read_handler).await;
                    });
                }
                Err(e) => {
                    error!("failed to accept TCP connection: {}", e);
                }
            }
        }
    }
}

/// Per-connection read loop: delivers receive events in order until the
/// connection reaches EOF, errors, or is closed through its endpoint, then
/// delivers exactly one close event.
async fn read_loop(conn: InboundConn, handler: Arc<dyn ConnectionHandler>) {
    loop {
        match conn.endpoint.recv(None).await {
            Ok(Some(data)) => handler.on_receive(conn.clone(), data).await,
            Ok(None) => {
                debug!(conn = %conn.id, "TCP connection reached end of stream");
                break;
            }
            Err(e) => {
                warn!(conn = %conn.id, peer = %conn.endpoint.peer_addr(), "TCP read error: {}", e);
                break;
            }
        }
    }
    handler.on_close(conn).await;
}
