use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use super::command::{process_for_ports, PortOwner};

/// Lookups that may fail in a row before application resolution is
/// switched off for the session.
const MAX_FAILURES: u32 = 3;

/// Names the local applications on the far side of control and socks
/// connections, caching answers per port.
pub struct AppResolver {
    timeout: Duration,
    cache: HashMap<u16, Option<String>>,
    failures: u32,
    enabled: bool,
}

impl AppResolver {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            timeout,
            cache: HashMap::new(),
            failures: 0,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve any ports not yet cached. Ports held by `daemon_pid` itself
    /// are ignored so the other end of the socket is named.
    pub async fn refresh(&mut self, ports: &[u16], daemon_pid: u32) {
        if !self.enabled {
            return;
        }

        let missing: Vec<u16> = ports
            .iter()
            .copied()
            .filter(|p| !self.cache.contains_key(p))
            .collect();
        if missing.is_empty() {
            return;
        }

        match process_for_ports(&missing, self.timeout).await {
            Ok(owners) => {
                self.failures = 0;
                for port in missing {
                    let name = owners.get(&port).and_then(|list| pick_owner(list, daemon_pid));
                    self.cache.insert(port, name);
                }
            }
            Err(e) => {
                self.failures += 1;
                debug!(error = %e, failures = self.failures, "application lookup failed");
                if self.failures >= MAX_FAILURES {
                    warn!("application lookups keep failing, disabling them");
                    self.enabled = false;
                }
            }
        }
    }

    pub fn name_for(&self, port: u16) -> Option<String> {
        self.cache.get(&port).cloned().flatten()
    }

    /// Forget cached answers.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, port: u16, name: Option<String>) {
        self.cache.insert(port, name);
    }
}

fn pick_owner(owners: &[PortOwner], daemon_pid: u32) -> Option<String> {
    owners
        .iter()
        .find(|o| o.pid != daemon_pid)
        .map(|o| o.command.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_owner_skips_daemon() {
        let owners = vec![
            PortOwner {
                command: "tor".into(),
                pid: 10,
            },
            PortOwner {
                command: "nyx".into(),
                pid: 20,
            },
        ];
        assert_eq!(pick_owner(&owners, 10).as_deref(), Some("nyx"));
        assert_eq!(pick_owner(&owners[..1], 10), None);
    }

    #[tokio::test]
    async fn test_disabled_resolver_does_nothing() {
        let mut apps = AppResolver::new(false, Duration::from_secs(1));
        apps.refresh(&[1234], 1).await;
        assert_eq!(apps.name_for(1234), None);
        assert!(!apps.is_enabled());
    }
}
