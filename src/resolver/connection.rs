use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Marker shown in place of a redacted address.
pub const REDACTED: &str = "<scrubbed>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Parse a protocol column such as `tcp`, `tcp6`, `TCP` or `udp4`.
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_ascii_lowercase();
        if lower.starts_with("tcp") {
            Some(Protocol::Tcp)
        } else if lower.starts_with("udp") {
            Some(Protocol::Udp)
        } else {
            None
        }
    }
}

/// Inferred purpose of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// A client of ours, or our own traffic to a non-relay.
    Client,
    /// Exit traffic leaving the network.
    Exit,
    /// Another relay.
    Relay,
    /// Control port connection.
    Control,
    /// Directory port connection.
    Directory,
    /// Socks port connection.
    Socks,
}

impl ConnectionType {
    /// Whether the peer address must never leave the resolver.
    pub fn is_privacy_sensitive(self) -> bool {
        matches!(self, ConnectionType::Client | ConnectionType::Exit)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Client => "client",
            ConnectionType::Exit => "exit",
            ConnectionType::Relay => "relay",
            ConnectionType::Control => "control",
            ConnectionType::Directory => "directory",
            ConnectionType::Socks => "socks",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One socket as reported by a resolution strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawConnection {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: Protocol,
    /// Reverse-resolved peer name, when the facility provides one.
    pub hostname: Option<String>,
}

impl RawConnection {
    pub fn new(local: SocketAddr, remote: SocketAddr, protocol: Protocol) -> Self {
        Self {
            local,
            remote,
            protocol,
            hostname: None,
        }
    }
}

/// Peer address after scrubbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Addr(SocketAddr),
    Redacted,
}

impl Endpoint {
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Addr(addr) => Some(*addr),
            Endpoint::Redacted => None,
        }
    }

    pub fn is_redacted(&self) -> bool {
        matches!(self, Endpoint::Redacted)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Addr(addr) => write!(f, "{addr}"),
            Endpoint::Redacted => f.write_str(REDACTED),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identity of a known relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayIdentity {
    pub nickname: String,
    pub fingerprint: String,
}

/// A resolved, scrubbed connection of the monitored process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub local: SocketAddr,
    pub remote: Endpoint,
    pub protocol: Protocol,
    pub kind: ConnectionType,
    pub pid: u32,
    pub application: Option<String>,
    pub relay: Option<RelayIdentity>,
    pub locale: Option<String>,
    pub hostname: Option<String>,
    /// First time this connection was seen.
    pub started_at: DateTime<Utc>,
    /// Present before monitoring began, so `started_at` is a lower bound.
    pub is_legacy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_label() {
        assert_eq!(Protocol::from_label("tcp6"), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_label("UDP"), Some(Protocol::Udp));
        assert_eq!(Protocol::from_label("udp4"), Some(Protocol::Udp));
        assert_eq!(Protocol::from_label("unix"), None);
    }

    #[test]
    fn test_endpoint_display() {
        let addr: SocketAddr = "1.2.3.4:443".parse().expect("valid addr");
        assert_eq!(Endpoint::Addr(addr).to_string(), "1.2.3.4:443");
        assert_eq!(Endpoint::Redacted.to_string(), REDACTED);
        assert_eq!(
            serde_json::to_string(&Endpoint::Redacted).expect("serializable"),
            format!("\"{REDACTED}\"")
        );
    }

    #[test]
    fn test_privacy_sensitive_types() {
        assert!(ConnectionType::Client.is_privacy_sensitive());
        assert!(ConnectionType::Exit.is_privacy_sensitive());
        assert!(!ConnectionType::Relay.is_privacy_sensitive());
        assert!(!ConnectionType::Control.is_privacy_sensitive());
    }
}
