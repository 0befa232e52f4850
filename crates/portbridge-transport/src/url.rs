//! Endpoint URL handling: `scheme://host:port`.

use crate::{TransportError, TransportResult};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Udp,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Tcp => write!(f, "tcp"),
            Scheme::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Scheme {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Scheme::Tcp),
            "udp" => Ok(Scheme::Udp),
            other => Err(TransportError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Split `scheme://host:port` into the scheme and the `host:port` authority.
pub fn parse_url(url: &str) -> TransportResult<(Scheme, String)> {
    let (scheme, host) = url
        .split_once("://")
        .ok_or_else(|| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: "missing scheme separator".to_string(),
        })?;

    let port = host.rsplit_once(':').map(|(_, p)| p).unwrap_or("");
    if port.parse::<u16>().is_err() {
        return Err(TransportError::InvalidUrl {
            url: url.to_string(),
            reason: "missing or invalid port".to_string(),
        });
    }

    Ok((scheme.parse()?, host.to_string()))
}

/// Build the listen URL for a local port, wildcard-bound, using the same
/// scheme as the remote side.
pub fn listen_url(scheme: Scheme, port: u16) -> String {
    format!("{}://0.0.0.0:{}", scheme, port)
}
