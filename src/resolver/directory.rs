use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;

use super::connection::RelayIdentity;

/// One relay known to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayEntry {
    pub address: IpAddr,
    pub or_port: u16,
    pub nickname: String,
    pub fingerprint: String,
    pub locale: Option<String>,
}

/// Address index over the relays known to the daemon.
#[derive(Debug, Clone, Default)]
pub struct RelayDirectory {
    entries: Vec<RelayEntry>,
    by_endpoint: HashMap<(IpAddr, u16), usize>,
    by_address: HashMap<IpAddr, Vec<usize>>,
}

impl RelayDirectory {
    pub fn new(entries: Vec<RelayEntry>) -> Self {
        let mut by_endpoint = HashMap::with_capacity(entries.len());
        let mut by_address: HashMap<IpAddr, Vec<usize>> = HashMap::with_capacity(entries.len());

        for (idx, entry) in entries.iter().enumerate() {
            by_endpoint.insert((entry.address, entry.or_port), idx);
            by_address.entry(entry.address).or_default().push(idx);
        }

        Self {
            entries,
            by_endpoint,
            by_address,
        }
    }

    /// Find the relay behind an address. An exact address and port match
    /// wins; otherwise the address alone must identify a single relay.
    pub fn lookup(&self, addr: SocketAddr) -> Option<&RelayEntry> {
        if let Some(&idx) = self.by_endpoint.get(&(addr.ip(), addr.port())) {
            return self.entries.get(idx);
        }

        match self.by_address.get(&addr.ip()).map(Vec::as_slice) {
            Some([idx]) => self.entries.get(*idx),
            _ => None,
        }
    }

    /// Identity of the relay behind an address.
    pub fn identity(&self, addr: SocketAddr) -> Option<RelayIdentity> {
        self.lookup(addr).map(|e| RelayIdentity {
            nickname: e.nickname.clone(),
            fingerprint: e.fingerprint.clone(),
        })
    }

    pub fn is_relay(&self, addr: SocketAddr) -> bool {
        self.by_address.contains_key(&addr.ip())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: &str, port: u16, nick: &str) -> RelayEntry {
        RelayEntry {
            address: addr.parse().expect("valid ip"),
            or_port: port,
            nickname: nick.to_string(),
            fingerprint: format!("{nick}-fp"),
            locale: Some("de".to_string()),
        }
    }

    #[test]
    fn test_lookup_exact_and_by_address() {
        let dir = RelayDirectory::new(vec![
            entry("10.0.0.1", 9001, "alpha"),
            entry("10.0.0.2", 443, "beta"),
            entry("10.0.0.2", 9001, "gamma"),
        ]);

        let alpha = dir.lookup("10.0.0.1:9030".parse().expect("addr"));
        assert_eq!(alpha.map(|e| e.nickname.as_str()), Some("alpha"));

        let gamma = dir.lookup("10.0.0.2:9001".parse().expect("addr"));
        assert_eq!(gamma.map(|e| e.nickname.as_str()), Some("gamma"));

        // Two relays share the address; without a port match it is ambiguous.
        assert!(dir.lookup("10.0.0.2:80".parse().expect("addr")).is_none());
        assert!(dir.is_relay("10.0.0.2:80".parse().expect("addr")));
        assert!(!dir.is_relay("10.9.9.9:80".parse().expect("addr")));
    }
}
