//! Bridge: forwards one local port to one remote address.

use crate::table::ConnectionTable;
use crate::Mapping;
use bytes::Bytes;
use portbridge_transport::{
    dial, listen_url, parse_url, ConnId, ConnectionHandler, Endpoint, InboundConn, Listener,
    Scheme, TransportError,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How many times the receive path retries the partner lookup before giving
/// up, and the fixed backoff between attempts. Bounds the wait for the
/// accept-time registration that the first inbound message can race.
pub const PAIR_RETRY_ATTEMPTS: u32 = 5;
pub const PAIR_RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("duplicate enabled mapping name [{0}]")]
    DuplicateName(String),
}

/// Forwarding engine for one enabled mapping.
///
/// Owns the listener bound to `0.0.0.0:<local>` (same scheme as the remote)
/// and the connection table for its live pairs. Created at startup and never
/// explicitly destroyed; process exit tears everything down.
pub struct Bridge {
    name: String,
    scheme: Scheme,
    host: String,
    remote: String,
    local_port: u16,
    table: ConnectionTable,
    healthy: AtomicBool,
    bound_addr: OnceLock<SocketAddr>,
}

impl Bridge {
    fn new(mapping: &Mapping) -> Result<Self, BridgeError> {
        let (scheme, host) = parse_url(&mapping.remote)?;
        Ok(Self {
            name: mapping.name.clone(),
            scheme,
            host,
            remote: mapping.remote.clone(),
            local_port: mapping.local,
            table: ConnectionTable::new(),
            healthy: AtomicBool::new(false),
            bound_addr: OnceLock::new(),
        })
    }

    /// Build the bridge and start its listener.
    ///
    /// A malformed remote address is a configuration error. A bind failure
    /// is not: it is logged and leaves the bridge unhealthy so the other
    /// mappings keep serving.
    pub async fn start(mapping: &Mapping) -> Result<Arc<Self>, BridgeError> {
        let bridge = Arc::new(Self::new(mapping)?);

        let listen = listen_url(bridge.scheme, bridge.local_port);
        match Listener::bind(&listen).await {
            Ok(listener) => {
                bridge.healthy.store(true, Ordering::SeqCst);
                let _ = bridge.bound_addr.set(listener.local_addr());
                info!(
                    bridge = %bridge.name,
                    listen = %listen,
                    remote = %bridge.remote,
                    "bridge listening"
                );

                let handler = bridge.clone();
                let owner = bridge.clone();
                tokio::spawn(async move {
                    if let Err(e) = listener.run(handler).await {
                        error!(bridge = %owner.name, "listener terminated: {}", e);
                        owner.healthy.store(false, Ordering::SeqCst);
                    }
                });
            }
            Err(e) => {
                error!(bridge = %bridge.name, listen = %listen, "failed to start listener: {}", e);
            }
        }

        Ok(bridge)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Host portion of the remote address.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// False when the listener failed to start (or died later).
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Address the listener actually bound, useful when the mapping asked
    /// for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    /// Number of live connection pairs.
    pub async fn active_pairs(&self) -> usize {
        self.table.len().await
    }

    /// Look up the relay partner, absorbing the accept/receive race.
    ///
    /// Registration runs on the accept task, so the first inbound message
    /// can arrive before the pair is in the table. The retry is bounded at
    /// `PAIR_RETRY_ATTEMPTS` x `PAIR_RETRY_BACKOFF`.
    async fn resolve_partner(&self, id: ConnId) -> Option<Arc<dyn Endpoint>> {
        for attempt in 0..PAIR_RETRY_ATTEMPTS {
            if let Some(outbound) = self.table.lookup(id).await {
                return Some(outbound);
            }
            if attempt + 1 < PAIR_RETRY_ATTEMPTS {
                tokio::time::sleep(PAIR_RETRY_BACKOFF).await;
            }
        }
        None
    }

    /// Relay outbound→inbound until a terminal event, then tear the pair
    /// down. Exactly one of these tasks exists per pair; it is the side that
    /// detects remote-initiated closure.
    fn spawn_reverse_relay(&self, conn: InboundConn, outbound: Arc<dyn Endpoint>) {
        let table = self.table.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            debug!(
                bridge = %name,
                client = %conn.endpoint.peer_addr(),
                remote = %outbound.peer_addr(),
                "reverse relay started"
            );
            loop {
                match outbound.recv(None).await {
                    Ok(Some(data)) => {
                        debug!(
                            from = %outbound.peer_addr(),
                            to = %conn.endpoint.peer_addr(),
                            length = data.len(),
                            "relaying remote data"
                        );
                        if let Err(e) = conn.endpoint.send(&data).await {
                            error!(
                                from = %outbound.peer_addr(),
                                to = %conn.endpoint.peer_addr(),
                                "send error: {}",
                                e
                            );
                            break;
                        }
                    }
                    // Graceful remote close. Not an error, not logged as one.
                    Ok(None) => {
                        debug!(remote = %outbound.peer_addr(), "remote closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!(
                            from = %outbound.peer_addr(),
                            to = %conn.endpoint.peer_addr(),
                            "read error: {}",
                            e
                        );
                        break;
                    }
                }
            }
            table.remove_and_close(conn.id, &conn.endpoint).await;
        });
    }
}

#[async_trait]
impl ConnectionHandler for Bridge {
    async fn on_accept(&self, conn: InboundConn) {
        info!(
            bridge = %self.name,
            client = %conn.endpoint.peer_addr(),
            remote = %self.remote,
            "connection accepted, forwarding to remote"
        );
        let outbound = match dial(&self.remote).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                // No dial retry; close the inbound side right away instead
                // of leaving it dangling until its first failed lookup.
                error!(
                    bridge = %self.name,
                    remote = %self.remote,
                    "connect to remote failed: {}",
                    e
                );
                conn.endpoint.close().await;
                return;
            }
        };
        self.table
            .insert(conn.id, conn.endpoint.clone(), outbound.clone())
            .await;
        self.spawn_reverse_relay(conn, outbound);
    }

    async fn on_receive(&self, conn: InboundConn, data: Bytes) {
        let outbound = match self.resolve_partner(conn.id).await {
            Some(endpoint) => endpoint,
            None => {
                warn!(
                    bridge = %self.name,
                    client = %conn.endpoint.peer_addr(),
                    "no relay partner after {} attempts, closing",
                    PAIR_RETRY_ATTEMPTS
                );
                conn.endpoint.close().await;
                return;
            }
        };
        debug!(
            from = %conn.endpoint.peer_addr(),
            to = %outbound.peer_addr(),
            length = data.len(),
            "relaying client data"
        );
        if let Err(e) = outbound.send(&data).await {
            error!(
                from = %conn.endpoint.peer_addr(),
                to = %outbound.peer_addr(),
                "send error: {}",
                e
            );
            self.table.remove_and_close(conn.id, &conn.endpoint).await;
        }
    }

    async fn on_close(&self, conn: InboundConn) {
        debug!(
            bridge = %self.name,
            client = %conn.endpoint.peer_addr(),
            "client connection closed"
        );
        self.table.remove_and_close(conn.id, &conn.endpoint).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockEndpoint;
    use portbridge_transport::ConnIdGenerator;
    use tokio::net::TcpListener;

    fn test_mapping(remote: &str) -> Mapping {
        Mapping {
            enable: true,
            name: "test".to_string(),
            local: 0,
            remote: remote.to_string(),
        }
    }

    fn test_bridge() -> Bridge {
        Bridge::new(&test_mapping("tcp://127.0.0.1:1")).unwrap()
    }

    fn inbound(endpoint: Arc<MockEndpoint>, ids: &ConnIdGenerator) -> InboundConn {
        InboundConn {
            id: ids.next_id(),
            endpoint,
        }
    }

    #[test]
    fn rejects_malformed_remote_address() {
        assert!(Bridge::new(&test_mapping("127.0.0.1:3306")).is_err());
        assert!(Bridge::new(&test_mapping("quic://127.0.0.1:443")).is_err());
    }

    #[test]
    fn parses_scheme_and_host_from_remote() {
        let bridge = Bridge::new(&test_mapping("udp://10.0.0.1:53")).unwrap();
        assert_eq!(bridge.scheme(), Scheme::Udp);
        assert_eq!(bridge.host(), "10.0.0.1:53");
        assert!(!bridge.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_without_partner_closes_inbound_after_bounded_retries() {
        let bridge = test_bridge();
        let ids = ConnIdGenerator::new();
        let endpoint = MockEndpoint::arc("client");
        let conn = inbound(endpoint.clone(), &ids);

        bridge.on_receive(conn, Bytes::from_static(b"orphan")).await;

        assert!(endpoint.is_closed());
        assert!(endpoint.sent().is_empty(), "no send may be attempted");
        assert!(bridge.table.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_forwards_to_registered_partner() {
        let bridge = test_bridge();
        let ids = ConnIdGenerator::new();
        let client = MockEndpoint::arc("client");
        let (remote, _feed) = MockEndpoint::new("remote");
        let conn = inbound(client.clone(), &ids);

        bridge
            .table
            .insert(conn.id, client.clone(), remote.clone())
            .await;
        bridge.on_receive(conn, Bytes::from_static(b"ping")).await;

        assert_eq!(remote.sent(), vec![Bytes::from_static(b"ping")]);
        assert!(!client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_waits_out_the_registration_race() {
        let bridge = Arc::new(test_bridge());
        let ids = ConnIdGenerator::new();
        let client = MockEndpoint::arc("client");
        let (remote, _feed) = MockEndpoint::new("remote");
        let conn = inbound(client.clone(), &ids);

        // Registration lands two backoff periods after the first message.
        let table = bridge.table.clone();
        let late_client = client.clone();
        let late_remote = remote.clone();
        let id = conn.id;
        tokio::spawn(async move {
            tokio::time::sleep(PAIR_RETRY_BACKOFF * 2).await;
            table.insert(id, late_client, late_remote).await;
        });

        bridge.on_receive(conn, Bytes::from_static(b"early")).await;

        assert_eq!(remote.sent(), vec![Bytes::from_static(b"early")]);
        assert!(!client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn forward_send_failure_tears_the_pair_down() {
        let bridge = test_bridge();
        let ids = ConnIdGenerator::new();
        let client = MockEndpoint::arc("client");
        let (remote, _feed) = MockEndpoint::new("remote");
        remote.fail_sends();
        let conn = inbound(client.clone(), &ids);

        bridge
            .table
            .insert(conn.id, client.clone(), remote.clone())
            .await;
        bridge.on_receive(conn, Bytes::from_static(b"doomed")).await;

        assert!(client.is_closed());
        assert!(remote.is_closed());
        assert!(bridge.table.is_empty().await);
    }

    #[tokio::test]
    async fn reverse_relay_copies_remote_data_and_tears_down_on_eof() {
        let bridge = test_bridge();
        let ids = ConnIdGenerator::new();
        let client = MockEndpoint::arc("client");
        let (remote, feed) = MockEndpoint::new("remote");
        let conn = inbound(client.clone(), &ids);

        bridge
            .table
            .insert(conn.id, client.clone(), remote.clone())
            .await;
        bridge.spawn_reverse_relay(conn, remote.clone());

        feed.send(Bytes::from_static(b"pong")).unwrap();
        drop(feed); // remote EOF

        tokio::time::timeout(Duration::from_secs(2), async {
            while !client.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pair was not torn down after remote EOF");

        assert_eq!(client.sent(), vec![Bytes::from_static(b"pong")]);
        assert!(remote.is_closed());
        assert!(bridge.table.is_empty().await);
    }

    #[tokio::test]
    async fn close_event_tears_the_pair_down() {
        let bridge = test_bridge();
        let ids = ConnIdGenerator::new();
        let client = MockEndpoint::arc("client");
        let (remote, _feed) = MockEndpoint::new("remote");
        let conn = inbound(client.clone(), &ids);

        bridge
            .table
            .insert(conn.id, client.clone(), remote.clone())
            .await;
        bridge.on_close(conn).await;

        assert!(client.is_closed());
        assert!(remote.is_closed());
        assert!(bridge.table.is_empty().await);
    }

    #[tokio::test]
    async fn dial_failure_closes_inbound_immediately() {
        // Bind then drop to get a port nothing listens on.
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let bridge =
            Bridge::new(&test_mapping(&format!("tcp://127.0.0.1:{}", dead_port))).unwrap();
        let ids = ConnIdGenerator::new();
        let client = MockEndpoint::arc("client");
        let conn = inbound(client.clone(), &ids);

        bridge.on_accept(conn).await;

        assert!(client.is_closed());
        assert!(bridge.table.is_empty().await);
    }
}
