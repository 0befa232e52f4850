//! Configuration file loading: a JSON array of forwarding mappings.

use anyhow::{Context, Result};
use portbridge_engine::Mapping;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Printed when loading fails, so the operator has a template to start from.
pub const SAMPLE_CONFIG: &str = r#"[
  {
    "enable": true,
    "name": "mysql",
    "local": 33306,
    "remote": "tcp://172.27.205.246:3306"
  },
  {
    "enable": true,
    "name": "postgres",
    "local": 65432,
    "remote": "tcp://172.27.205.246:5432"
  },
  {
    "enable": true,
    "name": "ssh",
    "local": 2222,
    "remote": "tcp://172.27.205.246:22"
  }
]"#;

pub fn load_mappings(path: &Path) -> Result<Vec<Mapping>> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mappings: Vec<Mapping> = serde_json::from_str(&json)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(mappings)
}
