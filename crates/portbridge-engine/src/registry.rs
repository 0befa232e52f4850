//! Bridge registry: one bridge per enabled mapping, plus the status table.

use crate::bridge::{Bridge, BridgeError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

/// One forwarding rule from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default)]
    pub enable: bool,
    pub name: String,
    pub local: u16,
    pub remote: String,
}

const STATUS_OK: &str = "\x1b[32m OK   \x1b[0m";
const STATUS_ERR: &str = "\x1b[31m ERR  \x1b[0m";
const STATUS_OK_PLAIN: &str = "  OK  ";
const STATUS_ERR_PLAIN: &str = "  ERR ";

fn status_label(healthy: bool) -> &'static str {
    // Plain labels on Windows consoles, which may not render ANSI colors.
    if cfg!(windows) {
        if healthy {
            STATUS_OK_PLAIN
        } else {
            STATUS_ERR_PLAIN
        }
    } else if healthy {
        STATUS_OK
    } else {
        STATUS_ERR
    }
}

/// Holds one started [`Bridge`] per enabled mapping, in input order.
pub struct BridgeRegistry {
    bridges: Vec<Arc<Bridge>>,
}

impl std::fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("bridges", &self.bridges.len())
            .finish()
    }
}

impl BridgeRegistry {
    /// Construct and start a bridge for every enabled mapping.
    ///
    /// A duplicate enabled name is a configuration error; it is detected
    /// before any listener is started, so a rejected configuration never
    /// serves traffic on any mapping.
    pub async fn create_forwards(mappings: &[Mapping]) -> Result<Self, BridgeError> {
        let enabled: Vec<&Mapping> = mappings.iter().filter(|m| m.enable).collect();

        let mut names = HashSet::new();
        for mapping in &enabled {
            if !names.insert(mapping.name.as_str()) {
                return Err(BridgeError::DuplicateName(mapping.name.clone()));
            }
        }

        let mut bridges = Vec::with_capacity(enabled.len());
        for mapping in enabled {
            bridges.push(Bridge::start(mapping).await?);
        }
        Ok(Self { bridges })
    }

    pub fn bridges(&self) -> &[Arc<Bridge>] {
        &self.bridges
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Bridge>> {
        self.bridges.iter().find(|b| b.name() == name)
    }

    /// Render the per-mapping status table: local port, remote address,
    /// name and listener health. Pure observability, no side effects.
    pub fn status_report(&self) -> String {
        let rule = "-".repeat(78);
        let mut out = String::new();
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(
            out,
            "|  {:<5}  |            {}            |           {}           | {:<5} |",
            "local", "remote", "name", "status"
        );
        let _ = writeln!(out, "{}", rule);
        for bridge in &self.bridges {
            let _ = writeln!(
                out,
                "|  {:<5}  | {:<28} | {:<24} | {} |",
                bridge.local_port(),
                bridge.remote(),
                bridge.name(),
                status_label(bridge.is_healthy())
            );
        }
        let _ = write!(out, "{}", rule);
        out
    }
}
