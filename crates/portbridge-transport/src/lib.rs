//! Socket transport for the portbridge forwarding engine.
//!
//! Exposes an [`Endpoint`] abstraction over bidirectional connections (TCP
//! streams and UDP peer flows), a [`Listener`] that accepts inbound endpoints
//! and dispatches events to a [`ConnectionHandler`], and a [`dial`] function
//! for opening outbound endpoints. The engine never touches sockets directly;
//! everything goes through these seams.

mod tcp;
mod udp;
mod url;

pub use tcp::TcpBridgeListener;
pub use udp::UdpBridgeListener;
pub use url::{listen_url, parse_url, Scheme};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid endpoint url [{url}]: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("endpoint closed")]
    Closed,

    #[error("receive timed out")]
    Timeout,
}

/// Handle for an accepted connection, issued by the listener.
///
/// Identifies the connection for the lifetime of the process; never reused,
/// so it is safe to key tables by it instead of by endpoint identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues unique [`ConnId`]s at accept time.
#[derive(Debug, Clone)]
pub struct ConnIdGenerator {
    next: Arc<AtomicU64>,
}

impl ConnIdGenerator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> ConnId {
        ConnId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// An opaque bidirectional connection.
///
/// `close` is idempotent: the first call tears the endpoint down and wakes
/// any read currently blocked on it (the read observes EOF); later calls are
/// no-ops. Sends after close fail with [`TransportError::Closed`].
#[async_trait]
pub trait Endpoint: Send + Sync + fmt::Debug {
    /// Send the payload verbatim. Returns the number of bytes written.
    async fn send(&self, data: &[u8]) -> TransportResult<usize>;

    /// Receive the next message. `None` timeout blocks indefinitely;
    /// `Ok(None)` is end-of-stream.
    async fn recv(&self, timeout: Option<Duration>) -> TransportResult<Option<Bytes>>;

    /// Close the endpoint. Safe to call any number of times, from any task.
    async fn close(&self);

    fn local_addr(&self) -> String;

    fn peer_addr(&self) -> String;

    fn is_closed(&self) -> bool;
}

/// An accepted inbound connection: the listener-issued id plus the endpoint.
#[derive(Debug, Clone)]
pub struct InboundConn {
    pub id: ConnId,
    pub endpoint: Arc<dyn Endpoint>,
}

/// Event callbacks a listener drives for its inbound connections.
///
/// Implemented once by the forwarding engine and handed to [`Listener::run`];
/// the listener stays decoupled from what the handler does with the events.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A new inbound connection was accepted.
    async fn on_accept(&self, conn: InboundConn);

    /// A fully received message arrived on an accepted connection.
    async fn on_receive(&self, conn: InboundConn, data: Bytes);

    /// The inbound connection itself closed (client disconnect).
    async fn on_close(&self, conn: InboundConn);
}

/// A bound listener for either supported scheme.
pub enum Listener {
    Tcp(TcpBridgeListener),
    Udp(UdpBridgeListener),
}

impl Listener {
    /// Bind a listener for `scheme://host:port`.
    pub async fn bind(url: &str) -> TransportResult<Self> {
        let (scheme, host) = parse_url(url)?;
        match scheme {
            Scheme::Tcp => Ok(Listener::Tcp(TcpBridgeListener::bind(&host).await?)),
            Scheme::Udp => Ok(Listener::Udp(UdpBridgeListener::bind(&host).await?)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Listener::Tcp(l) => l.local_addr(),
            Listener::Udp(l) => l.local_addr(),
        }
    }

    /// Accept connections and dispatch events to `handler` until the socket
    /// dies. Runs for the process lifetime in normal operation.
    pub async fn run(self, handler: Arc<dyn ConnectionHandler>) -> TransportResult<()> {
        match self {
            Listener::Tcp(l) => l.run(handler).await,
            Listener::Udp(l) => l.run(handler).await,
        }
    }
}

/// Open an outbound endpoint to `scheme://host:port`.
pub async fn dial(url: &str) -> TransportResult<Arc<dyn Endpoint>> {
    let (scheme, host) = parse_url(url)?;
    match scheme {
        Scheme::Tcp => tcp::dial(&host).await,
        Scheme::Udp => udp::dial(&host).await,
    }
}
