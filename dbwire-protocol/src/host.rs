//! Host descriptions and endpoint parsing.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An immutable `host:port` pair.
///
/// Ordering is by host then port, so sets of hosts iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostDescription {
    host: String,
    port: u16,
}

impl HostDescription {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parses an endpoint such as `tcp://10.0.0.1:8529`, `ssl://[::1]:8529`
    /// or plain `db1:8529`. Any trailing path is ignored.
    pub fn parse_endpoint(endpoint: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidEndpoint(endpoint.to_string());

        let rest = endpoint
            .trim()
            .split_once("://")
            .map_or(endpoint.trim(), |(_, rest)| rest);
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = after.strip_prefix(':').ok_or_else(invalid)?;
            (host, port)
        } else {
            let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
            // An unbracketed IPv6 literal would be ambiguous
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostDescription {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_endpoint(s)
    }
}
