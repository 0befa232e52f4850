//! In-memory mock endpoint for engine tests.

use async_trait::async_trait;
use bytes::Bytes;
use portbridge_transport::{Endpoint, TransportError, TransportResult};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Scriptable [`Endpoint`] that records sends and counts effective closes.
///
/// Incoming data is fed through the paired sender; dropping the sender (or
/// never taking one via [`MockEndpoint::arc`]) makes `recv` report EOF.
pub struct MockEndpoint {
    name: String,
    sent: Mutex<Vec<Bytes>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
    effective_closes: AtomicUsize,
    fail_sends: AtomicBool,
    shutdown: CancellationToken,
}

impl MockEndpoint {
    pub fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedSender<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            incoming: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            effective_closes: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        (endpoint, tx)
    }

    /// Endpoint with no feeder: `recv` reports EOF straight away.
    pub fn arc(name: &str) -> Arc<Self> {
        Self::new(name).0
    }

    /// Make every later `send` fail, as a dead peer would.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of close calls that actually transitioned the endpoint.
    pub fn effective_closes(&self) -> usize {
        self.effective_closes.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEndpoint")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn send(&self, data: &[u8]) -> TransportResult<usize> {
        if self.is_closed() || self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    async fn recv(&self, timeout: Option<Duration>) -> TransportResult<Option<Bytes>> {
        if self.is_closed() {
            return Ok(None);
        }
        let next = async {
            let mut incoming = self.incoming.lock().await;
            Ok(incoming.recv().await)
        };
        let read = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, next).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                },
                None => next.await,
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
        self.effective_closes.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn local_addr(&self) -> String {
        format!("mock-local-{}", self.name)
    }

    fn peer_addr(&self) -> String {
        format!("mock-peer-{}", self.name)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
