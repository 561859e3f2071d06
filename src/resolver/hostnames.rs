use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::CollectError;

/// New addresses looked up per refresh; the rest wait for the next cycle.
const MAX_PER_REFRESH: usize = 64;

/// Entries kept before the oldest are trimmed, and how many survive a trim.
const CACHE_LIMIT: usize = 70_000;
const CACHE_KEEP: usize = 50_000;

/// Future returned by [`ReverseLookup::lookup`].
pub type LookupFuture =
    Pin<Box<dyn Future<Output = Result<Option<String>, CollectError>> + Send + 'static>>;

/// Maps an address back to a hostname.
pub trait ReverseLookup: Send + Sync {
    /// `Ok(None)` means the address has no name.
    fn lookup(&self, ip: IpAddr) -> LookupFuture;
}

/// The system resolver (`getnameinfo`), run on the blocking pool.
pub struct SystemLookup;

impl ReverseLookup for SystemLookup {
    fn lookup(&self, ip: IpAddr) -> LookupFuture {
        Box::pin(system_lookup(ip))
    }
}

async fn system_lookup(ip: IpAddr) -> Result<Option<String>, CollectError> {
    let answer = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip))
        .await
        .map_err(|e| CollectError::ToolUnavailable {
            tool: "reverse dns".to_string(),
            detail: e.to_string(),
        })?;
    match answer {
        // Without a PTR record the numeric form comes back.
        Ok(name) if name.parse::<IpAddr>().is_ok() => Ok(None),
        Ok(name) => Ok(Some(name)),
        Err(e) => Err(CollectError::from_io("reverse dns", &e)),
    }
}

/// In-memory lookup with scripted answers, for tests and demos. Unknown
/// addresses have no name. Clones share the same answers.
#[derive(Clone, Default)]
pub struct ScriptedLookup {
    answers: Arc<Mutex<HashMap<IpAddr, Option<String>>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<Mutex<Vec<IpAddr>>>,
}

impl ScriptedLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, ip: IpAddr, name: Option<&str>) -> &Self {
        self.answers.lock().insert(ip, name.map(str::to_string));
        self
    }

    /// Delay every lookup, e.g. to exceed the timeout.
    pub fn set_delay(&self, delay: Option<Duration>) -> &Self {
        *self.delay.lock() = delay;
        self
    }

    /// Addresses looked up so far, in call order.
    pub fn calls(&self) -> Vec<IpAddr> {
        self.calls.lock().clone()
    }
}

impl ReverseLookup for ScriptedLookup {
    fn lookup(&self, ip: IpAddr) -> LookupFuture {
        self.calls.lock().push(ip);
        let answer = self.answers.lock().get(&ip).cloned().flatten();
        let delay = *self.delay.lock();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, CollectError>(answer)
        })
    }
}

/// Cached reverse DNS for connection peers.
///
/// Answers, including "no name" and failed lookups, are cached. Timed out
/// lookups are not, so they are retried on a later refresh.
pub struct HostnameCache {
    enabled: bool,
    timeout: Duration,
    lookup: Arc<dyn ReverseLookup>,
    cache: HashMap<IpAddr, (Option<String>, u64)>,
    age: u64,
    limit: usize,
    keep: usize,
}

impl HostnameCache {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self::with_lookup(enabled, timeout, Arc::new(SystemLookup))
    }

    pub fn with_lookup(enabled: bool, timeout: Duration, lookup: Arc<dyn ReverseLookup>) -> Self {
        Self {
            enabled,
            timeout,
            lookup,
            cache: HashMap::new(),
            age: 0,
            limit: CACHE_LIMIT,
            keep: CACHE_KEEP,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up addresses not yet cached, concurrently, each bounded by the
    /// timeout.
    pub async fn refresh(&mut self, addrs: &[IpAddr]) {
        if !self.enabled {
            return;
        }

        let mut missing: Vec<IpAddr> = addrs
            .iter()
            .copied()
            .filter(|ip| !self.cache.contains_key(ip))
            .collect();
        missing.sort();
        missing.dedup();
        missing.truncate(MAX_PER_REFRESH);
        if missing.is_empty() {
            return;
        }

        let mut pending = JoinSet::new();
        for ip in missing {
            let lookup = Arc::clone(&self.lookup);
            let timeout = self.timeout;
            pending.spawn(async move {
                let result = match tokio::time::timeout(timeout, lookup.lookup(ip)).await {
                    Ok(result) => result,
                    Err(_) => Err(CollectError::timeout("reverse dns", timeout)),
                };
                (ip, result)
            });
        }

        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((ip, Ok(name))) => self.store(ip, name),
                Ok((ip, Err(CollectError::Timeout { .. }))) => {
                    debug!(%ip, "hostname lookup timed out");
                }
                Ok((ip, Err(e))) => {
                    debug!(%ip, error = %e, "hostname lookup failed");
                    self.store(ip, None);
                }
                Err(e) => debug!(error = %e, "hostname lookup task failed"),
            }
        }
    }

    pub fn name_for(&self, ip: IpAddr) -> Option<String> {
        self.cache.get(&ip).and_then(|(name, _)| name.clone())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn store(&mut self, ip: IpAddr, name: Option<String>) {
        self.age += 1;
        self.cache.insert(ip, (name, self.age));

        if self.cache.len() > self.limit {
            let threshold = self.age.saturating_sub(self.keep as u64);
            let before = self.cache.len();
            self.cache.retain(|_, (_, age)| *age > threshold);
            info!(before, after = self.cache.len(), "trimmed hostname cache");
        }
    }

    #[cfg(test)]
    pub(crate) fn set_limits(&mut self, limit: usize, keep: usize) {
        self.limit = limit;
        self.keep = keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip address")
    }

    fn cache(lookup: &ScriptedLookup) -> HostnameCache {
        HostnameCache::with_lookup(true, Duration::from_secs(1), Arc::new(lookup.clone()))
    }

    #[tokio::test]
    async fn test_answers_are_cached() {
        let lookup = ScriptedLookup::new();
        lookup.answer(ip("192.0.2.7"), Some("relay.example.net"));
        let mut hostnames = cache(&lookup);

        let addrs = [ip("192.0.2.7"), ip("192.0.2.8"), ip("192.0.2.7")];
        hostnames.refresh(&addrs).await;
        hostnames.refresh(&addrs).await;

        assert_eq!(
            hostnames.name_for(ip("192.0.2.7")).as_deref(),
            Some("relay.example.net")
        );
        assert_eq!(hostnames.name_for(ip("192.0.2.8")), None);
        // "No name" is an answer too.
        assert_eq!(lookup.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_lookups_time_out_and_retry() {
        let lookup = ScriptedLookup::new();
        lookup
            .answer(ip("198.51.100.1"), Some("slow.example.net"))
            .set_delay(Some(Duration::from_secs(30)));
        let mut hostnames = cache(&lookup);

        let started = tokio::time::Instant::now();
        hostnames.refresh(&[ip("198.51.100.1")]).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(hostnames.is_empty());

        lookup.set_delay(None);
        hostnames.refresh(&[ip("198.51.100.1")]).await;
        assert_eq!(
            hostnames.name_for(ip("198.51.100.1")).as_deref(),
            Some("slow.example.net")
        );
        assert_eq!(lookup.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_looks_up() {
        let lookup = ScriptedLookup::new();
        let mut hostnames =
            HostnameCache::with_lookup(false, Duration::from_secs(1), Arc::new(lookup.clone()));
        hostnames.refresh(&[ip("192.0.2.1")]).await;
        assert!(lookup.calls().is_empty());
        assert!(!hostnames.is_enabled());
    }

    #[tokio::test]
    async fn test_oldest_entries_are_trimmed() {
        let lookup = ScriptedLookup::new();
        let mut hostnames = cache(&lookup);
        hostnames.set_limits(4, 2);

        for last in 1..=5u8 {
            hostnames.refresh(&[IpAddr::from([192, 0, 2, last])]).await;
        }

        assert_eq!(hostnames.len(), 2);
        hostnames.refresh(&[IpAddr::from([192, 0, 2, 5])]).await;
        assert_eq!(lookup.calls().len(), 5);
    }
}
