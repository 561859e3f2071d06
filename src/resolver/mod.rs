//! Connection resolution: a set of interchangeable strategies and the
//! resolver that probes, fails over, throttles and scrubs their output.

pub mod apps;
pub mod command;
pub mod connection;
pub mod directory;
pub mod hostnames;
pub mod proc_net;
pub mod scripted;
pub mod strategy;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use connection::{
    Connection, ConnectionType, Endpoint, Protocol, RawConnection, RelayIdentity, REDACTED,
};
pub use directory::{RelayDirectory, RelayEntry};
pub use hostnames::{HostnameCache, ReverseLookup, ScriptedLookup, SystemLookup};
pub use scripted::ScriptedStrategy;
pub use strategy::{build_strategy, host_defaults, Strategy, StrategyKind};

use self::apps::AppResolver;
use crate::config::{Config, Role};
use crate::control::ListenerPorts;
use crate::error::{CollectError, ResolutionError};
use crate::events::entry::Diagnostic;

/// Where the resolver is in its strategy lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "strategy", rename_all = "snake_case")]
pub enum ResolverState {
    Uninitialized,
    Probing,
    Active(StrategyKind),
    /// The strategy failed too often and is being replaced.
    Degraded(StrategyKind),
    /// Every strategy failed. Cleared only by a reset.
    Exhausted,
}

impl fmt::Display for ResolverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverState::Uninitialized => f.write_str("uninitialized"),
            ResolverState::Probing => f.write_str("probing"),
            ResolverState::Active(kind) => write!(f, "active({kind})"),
            ResolverState::Degraded(kind) => write!(f, "degraded({kind})"),
            ResolverState::Exhausted => f.write_str("exhausted"),
        }
    }
}

/// Tunables for [`ConnectionResolver`].
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_tolerance: u32,
    pub slow_fraction: f64,
    pub max_interval: Duration,
    pub fast_streak: u32,
    pub lookups: bool,
    pub resolve_apps: bool,
    pub role: Role,
    pub ports: ListenerPorts,
}

impl ResolverSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let r = &cfg.resolver;
        let p = &cfg.process;
        Self {
            interval: r.interval,
            timeout: r.timeout,
            failure_tolerance: r.failure_tolerance,
            slow_fraction: r.slow_fraction,
            max_interval: r.max_interval,
            fast_streak: r.fast_streak,
            lookups: r.lookups,
            resolve_apps: r.resolve_apps,
            role: p.role,
            ports: ListenerPorts {
                control: p.control_port,
                or: p.or_port,
                dir: p.dir_port,
                socks: p.socks_port,
            },
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Resolver status exposed with every listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolverHealth {
    pub state: ResolverState,
    pub active: Option<StrategyKind>,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub consecutive_failures: u32,
    #[serde(with = "humantime_serde")]
    pub last_duration: Option<Duration>,
    /// Successful lookups this session.
    pub resolutions: u64,
    pub blacklisted: Vec<StrategyKind>,
}

/// Result of one resolver cycle.
#[derive(Debug, Clone)]
pub struct ResolverOutput {
    pub connections: Arc<[Connection]>,
    /// The listing is carried over or empty because this cycle failed.
    pub stale: bool,
    pub health: ResolverHealth,
    pub diagnostics: Vec<Diagnostic>,
    pub added: usize,
    pub removed: usize,
    /// A different strategy became active during this cycle.
    pub switched: bool,
}

type ConnectionKey = (SocketAddr, SocketAddr, Protocol);

#[derive(Debug, Clone, Copy)]
struct Seen {
    first_seen: DateTime<Utc>,
    legacy: bool,
}

/// Picks a working strategy and keeps the last good listing.
///
/// The resolver is owned by a single worker; other components only see the
/// immutable listings it returns.
pub struct ConnectionResolver {
    settings: ResolverSettings,
    strategies: Vec<Box<dyn Strategy>>,
    custom: Option<Box<dyn Strategy>>,
    state: ResolverState,
    /// Strategy abandoned during the current cycle, reported in its health.
    degraded: Option<StrategyKind>,
    active: Option<usize>,
    blacklisted: Vec<StrategyKind>,
    consecutive_failures: u32,
    interval: Duration,
    fast_count: u32,
    last_duration: Option<Duration>,
    resolutions: u64,
    last_good: Arc<[Connection]>,
    seen: HashMap<ConnectionKey, Seen>,
    had_success: bool,
    exhausted_reported: bool,
    directory: RelayDirectory,
    apps: AppResolver,
    hostnames: HostnameCache,
    pid: Option<u32>,
}

impl ConnectionResolver {
    /// Create a resolver over `strategies`, in preference order.
    pub fn new(settings: ResolverSettings, strategies: Vec<Box<dyn Strategy>>) -> Self {
        let apps = AppResolver::new(settings.resolve_apps, settings.timeout);
        let hostnames = HostnameCache::new(settings.lookups, settings.timeout);
        Self {
            interval: settings.interval,
            settings,
            strategies,
            custom: None,
            state: ResolverState::Uninitialized,
            degraded: None,
            active: None,
            blacklisted: Vec::new(),
            consecutive_failures: 0,
            fast_count: 0,
            last_duration: None,
            resolutions: 0,
            last_good: Arc::from(Vec::new()),
            seen: HashMap::new(),
            had_success: false,
            exhausted_reported: false,
            directory: RelayDirectory::default(),
            apps,
            hostnames,
            pid: None,
        }
    }

    /// Use another reverse DNS source for hostname lookups.
    pub fn with_reverse_lookup(mut self, lookup: Arc<dyn ReverseLookup>) -> Self {
        self.hostnames =
            HostnameCache::with_lookup(self.settings.lookups, self.settings.timeout, lookup);
        self
    }

    /// Build the configured strategies, or the host's default order.
    pub fn from_config(cfg: &Config) -> Self {
        let kinds = if cfg.resolver.strategies.is_empty() {
            host_defaults()
        } else {
            cfg.resolver.strategies.clone()
        };
        let strategies = kinds
            .into_iter()
            .map(|kind| build_strategy(kind, cfg.resolver.timeout))
            .collect();
        Self::new(ResolverSettings::from_config(cfg), strategies)
    }

    /// Use a single user-chosen strategy instead of probing. It is never
    /// blacklisted. `None` returns to probing.
    pub fn set_custom_strategy(&mut self, strategy: Option<Box<dyn Strategy>>) {
        self.custom = strategy;
        self.state = ResolverState::Uninitialized;
        self.active = None;
        self.consecutive_failures = 0;
        self.exhausted_reported = false;
    }

    /// Replace the relay directory used for type inference and identities.
    pub fn set_directory(&mut self, directory: RelayDirectory) {
        debug!(relays = directory.len(), "relay directory updated");
        self.directory = directory;
    }

    /// Update the daemon's listener ports used for type inference.
    pub fn set_ports(&mut self, ports: ListenerPorts) {
        if self.settings.ports != ports {
            debug!(?ports, "listener ports updated");
            self.settings.ports = ports;
        }
    }

    /// Forget everything learned about the current process.
    pub fn reset(&mut self) {
        self.state = ResolverState::Uninitialized;
        self.degraded = None;
        self.active = None;
        self.blacklisted.clear();
        self.consecutive_failures = 0;
        self.interval = self.settings.interval;
        self.fast_count = 0;
        self.last_good = Arc::from(Vec::new());
        self.seen.clear();
        self.had_success = false;
        self.exhausted_reported = false;
        self.apps.clear();
        self.pid = None;
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    /// Current adaptive polling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Health as of the last cycle. A cycle that abandoned a strategy
    /// reports it as degraded even though a replacement may be active.
    pub fn health(&self) -> ResolverHealth {
        ResolverHealth {
            state: self.degraded.map_or(self.state, ResolverState::Degraded),
            active: self.active_kind(),
            interval: self.interval,
            consecutive_failures: self.consecutive_failures,
            last_duration: self.last_duration,
            resolutions: self.resolutions,
            blacklisted: self.blacklisted.clone(),
        }
    }

    fn active_kind(&self) -> Option<StrategyKind> {
        match self.state {
            ResolverState::Active(kind) => Some(kind),
            _ => None,
        }
    }

    /// Run one resolution cycle for `pid`. Never fails: problems show up as
    /// a stale listing plus diagnostics.
    pub async fn poll(&mut self, pid: u32, process_name: &str) -> ResolverOutput {
        if self.pid.is_some_and(|p| p != pid) {
            info!(old = ?self.pid, new = pid, "monitored process changed, resetting resolver");
            self.reset();
        }
        self.pid = Some(pid);
        self.degraded = None;

        let mut diagnostics = Vec::new();
        let previous = self.active_kind();

        let started = Instant::now();
        let raw = self.resolve_once(pid, process_name, &mut diagnostics).await;
        let elapsed = started.elapsed();
        self.last_duration = Some(elapsed);
        self.adapt_interval(elapsed);

        let current = self.active_kind();
        let switched = previous.is_some() && current.is_some() && previous != current;

        let (connections, stale, added, removed) = match raw {
            Some(raw) => {
                self.resolutions += 1;
                let (connections, added, removed) = self.build(raw, pid).await;
                self.last_good = Arc::clone(&connections);
                (connections, false, added, removed)
            }
            None if self.state == ResolverState::Exhausted => (Arc::from(Vec::new()), true, 0, 0),
            None => (Arc::clone(&self.last_good), true, 0, 0),
        };

        ResolverOutput {
            connections,
            stale,
            health: self.health(),
            diagnostics,
            added,
            removed,
            switched,
        }
    }

    async fn resolve_once(
        &mut self,
        pid: u32,
        process_name: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<Vec<RawConnection>> {
        if let Some(custom) = &self.custom {
            let kind = custom.kind();
            return match attempt(custom.as_ref(), pid, process_name, self.settings.timeout).await {
                Ok(conns) => {
                    self.consecutive_failures = 0;
                    self.state = ResolverState::Active(kind);
                    Some(conns)
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    warn!(strategy = %kind, error = %e, "custom connection resolver failed");
                    None
                }
            };
        }

        let kind = match self.state {
            ResolverState::Exhausted => return None,
            ResolverState::Active(kind) => kind,
            ResolverState::Uninitialized | ResolverState::Probing | ResolverState::Degraded(_) => {
                return self.probe(pid, process_name, diagnostics).await;
            }
        };
        let Some(strategy) = self.active.and_then(|idx| self.strategies.get(idx)) else {
            return self.probe(pid, process_name, diagnostics).await;
        };

        let err = match attempt(strategy.as_ref(), pid, process_name, self.settings.timeout).await {
            Ok(conns) => {
                self.consecutive_failures = 0;
                return Some(conns);
            }
            Err(e) => e,
        };

        self.consecutive_failures += 1;
        debug!(
            strategy = %kind,
            error = %err,
            failures = self.consecutive_failures,
            "connection lookup failed"
        );
        if self.consecutive_failures < self.settings.failure_tolerance {
            return None;
        }

        self.state = ResolverState::Degraded(kind);
        self.degraded = Some(kind);
        self.active = None;
        self.blacklisted.push(kind);

        let next = self
            .strategies
            .iter()
            .map(|s| s.kind())
            .find(|k| !self.blacklisted.contains(k));
        let message = match next {
            Some(next) => format!("Unable to query connections with {kind}, trying {next}"),
            None => format!("Unable to query connections with {kind}"),
        };
        warn!(strategy = %kind, error = %err, next = ?next, "abandoning connection resolver");
        diagnostics.push(Diagnostic::notice(message));

        self.probe(pid, process_name, diagnostics).await
    }

    /// Try every strategy not yet blacklisted, in preference order, and
    /// adopt the first that answers.
    async fn probe(
        &mut self,
        pid: u32,
        process_name: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<Vec<RawConnection>> {
        self.state = ResolverState::Probing;

        for (idx, strategy) in self.strategies.iter().enumerate() {
            let kind = strategy.kind();
            if self.blacklisted.contains(&kind) {
                continue;
            }

            match attempt(strategy.as_ref(), pid, process_name, self.settings.timeout).await {
                Ok(conns) => {
                    info!(strategy = %kind, "connection resolver selected");
                    self.state = ResolverState::Active(kind);
                    self.active = Some(idx);
                    self.consecutive_failures = 0;
                    return Some(conns);
                }
                Err(e) => debug!(strategy = %kind, error = %e, "connection resolver probe failed"),
            }
        }

        self.state = ResolverState::Exhausted;
        self.active = None;
        if !self.exhausted_reported {
            self.exhausted_reported = true;
            warn!(pid, "all connection resolvers failed");
            diagnostics.push(Diagnostic::warn("All connection resolvers failed"));
        }
        None
    }

    /// Double the interval after a slow lookup, halve it back after a
    /// streak of fast ones.
    fn adapt_interval(&mut self, elapsed: Duration) {
        let threshold = self.settings.interval.mul_f64(self.settings.slow_fraction);

        if elapsed > threshold {
            self.fast_count = 0;
            let next = self
                .interval
                .saturating_mul(2)
                .min(self.settings.max_interval);
            if next > self.interval {
                self.interval = next;
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "connection lookup time increasing to {:.1} seconds per call",
                    next.as_secs_f64()
                );
            }
        } else if self.interval > self.settings.interval {
            self.fast_count += 1;
            if self.fast_count >= self.settings.fast_streak {
                self.fast_count = 0;
                self.interval = (self.interval / 2).max(self.settings.interval);
                debug!(
                    interval = ?self.interval,
                    "connection lookups fast again, lowering interval"
                );
            }
        }
    }

    /// Type, annotate and scrub a raw listing, tracking first-seen times.
    async fn build(
        &mut self,
        raw: Vec<RawConnection>,
        pid: u32,
    ) -> (Arc<[Connection]>, usize, usize) {
        let now = Utc::now();
        let first_listing = !self.had_success;
        self.had_success = true;

        let typed: Vec<(RawConnection, ConnectionType)> = raw
            .into_iter()
            .map(|r| {
                let ports = &self.settings.ports;
                let kind = infer_type(&r, ports, self.settings.role, &self.directory);
                (r, kind)
            })
            .collect();

        if self.apps.is_enabled() {
            let ports: Vec<u16> = typed
                .iter()
                .filter(|(_, kind)| has_local_peer(*kind))
                .map(|(r, _)| r.remote.port())
                .collect();
            self.apps.refresh(&ports, pid).await;
        }

        if self.hostnames.is_enabled() {
            let peers: Vec<IpAddr> = typed
                .iter()
                .filter(|(r, kind)| r.hostname.is_none() && !kind.is_privacy_sensitive())
                .map(|(r, _)| r.remote.ip())
                .collect();
            self.hostnames.refresh(&peers).await;
        }

        let mut seen = HashMap::with_capacity(typed.len());
        let mut connections = Vec::with_capacity(typed.len());
        let mut added = 0;

        for (raw, kind) in typed {
            let key = (raw.local, raw.remote, raw.protocol);
            let entry = match self.seen.get(&key) {
                Some(prev) => *prev,
                None => {
                    added += 1;
                    Seen {
                        first_seen: now,
                        legacy: first_listing,
                    }
                }
            };
            seen.insert(key, entry);

            let application = if has_local_peer(kind) {
                self.apps.name_for(raw.remote.port())
            } else {
                None
            };
            let relay = (kind == ConnectionType::Relay)
                .then(|| self.directory.lookup(raw.remote))
                .flatten();

            connections.push(Connection {
                local: raw.local,
                remote: scrub_remote(raw.remote, kind),
                protocol: raw.protocol,
                kind,
                pid,
                application,
                relay: relay.map(|e| RelayIdentity {
                    nickname: e.nickname.clone(),
                    fingerprint: e.fingerprint.clone(),
                }),
                locale: relay.and_then(|e| e.locale.clone()),
                hostname: self.hostname_for(&raw, kind),
                started_at: entry.first_seen,
                is_legacy: entry.legacy,
            });
        }

        let removed = self.seen.keys().filter(|k| !seen.contains_key(*k)).count();
        self.seen = seen;

        (Arc::from(connections), added, removed)
    }

    /// Hostnames never leave the resolver for privacy-sensitive peers.
    fn hostname_for(&self, raw: &RawConnection, kind: ConnectionType) -> Option<String> {
        if !self.settings.lookups || kind.is_privacy_sensitive() {
            return None;
        }
        raw.hostname
            .clone()
            .or_else(|| self.hostnames.name_for(raw.remote.ip()))
    }
}

/// Call a strategy, failing with a timeout instead of hanging.
async fn attempt(
    strategy: &dyn Strategy,
    pid: u32,
    process_name: &str,
    timeout: Duration,
) -> Result<Vec<RawConnection>, ResolutionError> {
    match tokio::time::timeout(timeout, strategy.resolve(pid, process_name)).await {
        Ok(result) => result,
        Err(_) => Err(CollectError::timeout(strategy.kind().to_string(), timeout)),
    }
}

/// Connections whose other end is a local application.
fn has_local_peer(kind: ConnectionType) -> bool {
    matches!(kind, ConnectionType::Control | ConnectionType::Socks)
}

/// Infer what a connection is for from the daemon's listeners, its role and
/// the relays it knows about.
pub fn infer_type(
    raw: &RawConnection,
    ports: &ListenerPorts,
    role: Role,
    directory: &RelayDirectory,
) -> ConnectionType {
    let local = Some(raw.local.port());

    if local == ports.control {
        ConnectionType::Control
    } else if local == ports.socks {
        ConnectionType::Socks
    } else if local == ports.dir {
        ConnectionType::Directory
    } else if local == ports.or {
        if directory.is_relay(raw.remote) {
            ConnectionType::Relay
        } else {
            ConnectionType::Client
        }
    } else if directory.is_relay(raw.remote) {
        ConnectionType::Relay
    } else if role == Role::Exit {
        ConnectionType::Exit
    } else {
        ConnectionType::Relay
    }
}

/// Peer address as it may leave the resolver.
pub fn scrub_remote(remote: SocketAddr, kind: ConnectionType) -> Endpoint {
    if kind.is_privacy_sensitive() {
        Endpoint::Redacted
    } else {
        Endpoint::Addr(remote)
    }
}
