//! The portbridge forwarding engine.
//!
//! One [`Bridge`] per configured mapping listens on a local port and relays
//! all traffic to a remote endpoint. The [`ConnectionTable`] tracks live
//! connection pairs so either side can tear the pair down cleanly when the
//! other fails, and the [`BridgeRegistry`] owns one bridge per enabled
//! mapping and renders the status report.

mod bridge;
mod registry;
mod table;

pub use bridge::{Bridge, BridgeError, PAIR_RETRY_ATTEMPTS, PAIR_RETRY_BACKOFF};
pub use registry::{BridgeRegistry, Mapping};
pub use table::ConnectionTable;

#[cfg(test)]
mod testutil;
