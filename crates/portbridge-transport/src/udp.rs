//! UDP transport: peer flows demultiplexed from a single listening socket.
//!
//! UDP has no connections, so the listener synthesizes one inbound endpoint
//! per source address: the first datagram from an unseen peer raises an
//! accept event, every datagram raises a receive event. There is no close
//! event to raise since datagram flows have no end-of-stream.

use crate::{
    ConnIdGenerator, ConnectionHandler, Endpoint, InboundConn, TransportError, TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_DATAGRAM_SIZE: usize = 65536;

/// An outbound UDP endpoint backed by a connected socket.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: String,
    peer_addr: String,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Endpoint for UdpEndpoint {
    async fn send(&self, data: &[u8]) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.socket.send(data).await?)
    }

    async fn recv(&self, timeout: Option<Duration>) -> TransportResult<Option<Bytes>> {
        if self.is_closed() {
            return Ok(None);
        }
        let read = async {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, self.socket.recv(&mut buf)).await
                {
                    Ok(result) => {
                        let n = result?;
                        buf.truncate(n);
                        Ok(Some(Bytes::from(buf)))
                    }
                    Err(_) => Err(TransportError::Timeout),
                },
                None => {
                    let n = self.socket.recv(&mut buf).await?;
                    buf.truncate(n);
                    Ok(Some(Bytes::from(buf)))
                }
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

/// Open an outbound UDP endpoint to `host:port`.
pub(crate) async fn dial(addr: &str) -> TransportResult<Arc<dyn Endpoint>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    let local_addr = socket.local_addr()?.to_string();
    let peer_addr = socket.peer_addr()?.to_string();
    Ok(Arc::new(UdpEndpoint {
        socket,
        local_addr,
        peer_addr,
        closed: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
    }))
}

/// An inbound UDP peer flow sharing the listener's socket.
///
/// Inbound datagrams are delivered through the listener's receive callback,
/// not through `recv`; `recv` on this endpoint only observes close.
pub struct UdpPeerEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: String,
    peer: SocketAddr,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl fmt::Debug for UdpPeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpPeerEndpoint")
            .field("local_addr", &self.local_addr)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Endpoint for UdpPeerEndpoint {
    async fn send(&self, data: &[u8]) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(self.socket.send_to(data, self.peer).await?)
    }

    async fn recv(&self, timeout: Option<Duration>) -> TransportResult<Option<Bytes>> {
        if self.is_closed() {
            return Ok(None);
        }
        match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.shutdown.cancelled()).await {
                    Ok(()) => Ok(None),
                    Err(_) => Err(TransportError::Timeout),
                }
            }
            None => {
                self.shutdown.cancelled().await;
                Ok(None)
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn peer_addr(&self) -> String {
        self.peer.to_string()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// UDP listener: demultiplexes datagrams into per-peer inbound flows.
pub struct UdpBridgeListener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    ids: ConnIdGenerator,
}

impl UdpBridgeListener {
    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            ids: ConnIdGenerator::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self, handler: Arc<dyn ConnectionHandler>) -> TransportResult<()> {
        let mut peers: HashMap<SocketAddr, InboundConn> = HashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            let conn = match peers.get(&peer) {
                Some(existing) if !existing.endpoint.is_closed() => existing.clone(),
                _ => {
                    let id = self.ids.next_id();
                    let endpoint: Arc<dyn Endpoint> = Arc::new(UdpPeerEndpoint {
                        socket: self.socket.clone(),
                        local_addr: self.local_addr.to_string(),
                        peer,
                        closed: AtomicBool::new(false),
                        shutdown: CancellationToken::new(),
                    });
                    let conn = InboundConn { id, endpoint };
                    peers.insert(peer, conn.clone());
                    debug!(conn = %id, peer = %peer, "new UDP peer flow");

                    // Same dispatch shape as TCP: the accept event runs on
                    // its own task and can race the first receive event.
                    let accept_handler = handler.clone();
                    let accept_conn = conn.clone();
                    tokio::spawn(async move {
                        accept_handler.on_accept(accept_conn).await;
                    });
                    conn
                }
            };
            handler
                .on_receive(conn, Bytes::copy_from_slice(&buf[..n]))
                .await;
        }
    }
}
