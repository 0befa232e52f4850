//! Connection table: live inbound→outbound pairs for one bridge.

use portbridge_transport::{ConnId, Endpoint};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

struct Pair {
    inbound: Arc<dyn Endpoint>,
    outbound: Arc<dyn Endpoint>,
}

/// Concurrency-safe map from an inbound connection to its paired outbound
/// endpoint.
///
/// The table is the sole owner of a pair's existence: every teardown goes
/// through [`remove_and_close`](ConnectionTable::remove_and_close), which
/// takes the entry out under the exclusive lock exactly once, so an inbound
/// key is present if and only if its relay is live. Endpoint close is
/// idempotent, which makes at-least-once close from concurrent terminal
/// events safe.
#[derive(Clone)]
pub struct ConnectionTable {
    pairs: Arc<RwLock<HashMap<ConnId, Pair>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            pairs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a freshly dialed pair. Callers insert once, immediately
    /// after a successful dial.
    pub async fn insert(&self, id: ConnId, inbound: Arc<dyn Endpoint>, outbound: Arc<dyn Endpoint>) {
        self.pairs
            .write()
            .await
            .insert(id, Pair { inbound, outbound });
    }

    /// Current relay partner for an inbound connection, if the pair is live.
    pub async fn lookup(&self, id: ConnId) -> Option<Arc<dyn Endpoint>> {
        self.pairs.read().await.get(&id).map(|p| p.outbound.clone())
    }

    /// Tear the pair down: remove the entry and close both endpoints.
    ///
    /// Idempotent. If the entry is already gone (a duplicate terminal event
    /// from the other direction won the race), the caller's inbound endpoint
    /// is closed again defensively and the table is untouched.
    pub async fn remove_and_close(&self, id: ConnId, inbound: &Arc<dyn Endpoint>) {
        let removed = self.pairs.write().await.remove(&id);
        match removed {
            Some(pair) => {
                debug!(conn = %id, "closing connection pair");
                pair.outbound.close().await;
                pair.inbound.close().await;
            }
            None => {
                inbound.close().await;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pairs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pairs.read().await.is_empty()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
