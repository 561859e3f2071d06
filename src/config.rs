use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::events::entry::Runlevel;
use crate::resolver::strategy::StrategyKind;

/// Top-level configuration for the relaymon collector.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// The monitored daemon process.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Control channel call policy.
    #[serde(default)]
    pub control: ControlConfig,

    /// Connection resolution configuration.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Event normalization and deduplication configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// Numeric sampling configuration.
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Configuration file differ.
    #[serde(default)]
    pub confdiff: ConfDiffConfig,

    /// Snapshot scheduling and staleness policy.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Bounded grace period for producer workers on shutdown. Default: 2s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Role the monitored daemon plays. Exit relays are privacy sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    #[default]
    Relay,
    Exit,
    Bridge,
}

/// Monitored process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Process name used for discovery and resolver filtering. Default: "tor".
    #[serde(default = "default_process_name")]
    pub name: String,

    /// Fixed pid, skipping discovery.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Role the daemon plays.
    #[serde(default)]
    pub role: Role,

    /// Daemon log file to read and follow.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Daemon state file used for bandwidth backfill.
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    #[serde(default)]
    pub control_port: Option<u16>,
    #[serde(default)]
    pub or_port: Option<u16>,
    #[serde(default)]
    pub dir_port: Option<u16>,
    #[serde(default)]
    pub socks_port: Option<u16>,
}

/// Control channel call policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Timeout applied to every control channel call. Default: 5s.
    #[serde(default = "default_control_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Re-subscribe when the event subscription ends. Default: true.
    #[serde(default = "default_true")]
    pub reconnect: bool,

    /// Delay before re-subscribing. Default: 5s.
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

/// Connection resolver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Strategy preference order. Empty selects the platform default order.
    #[serde(default)]
    pub strategies: Vec<StrategyKind>,

    /// Configured polling interval. Default: 5s.
    #[serde(default = "default_resolver_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound on a single strategy call. Default: 5s.
    #[serde(default = "default_resolver_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failures before the active strategy is abandoned. Default: 3.
    #[serde(default = "default_failure_tolerance")]
    pub failure_tolerance: u32,

    /// A lookup slower than this fraction of `interval` counts as slow. Default: 0.5.
    #[serde(default = "default_slow_fraction")]
    pub slow_fraction: f64,

    /// Cap for the adaptive interval. Default: 60s.
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    /// Consecutive fast lookups before the interval is halved. Default: 3.
    #[serde(default = "default_fast_streak")]
    pub fast_streak: u32,

    /// Reverse DNS for relay peers. Default: false.
    #[serde(default)]
    pub lookups: bool,

    /// Resolve application names for control and socks connections. Default: true.
    #[serde(default = "default_true")]
    pub resolve_apps: bool,
}

/// Event normalization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Maximum retained events. Default: 1000.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,

    /// Identical events further apart than this are kept separate. Default: 60s.
    #[serde(default = "default_dedup_window", with = "humantime_serde")]
    pub dedup_window: Duration,

    /// Per-runlevel message prefixes treated as identical. A leading `*`
    /// matches anywhere in the message.
    #[serde(default = "default_dedup_prefixes")]
    pub dedup_prefixes: HashMap<Runlevel, Vec<String>>,

    /// Initial regex filter options.
    #[serde(default)]
    pub filters: Vec<String>,

    /// Number of recent filter selections remembered. Default: 5.
    #[serde(default = "default_max_filters")]
    pub max_filters: usize,

    /// Daemon runlevels to subscribe to. Default: NOTICE, WARN, ERR.
    #[serde(default = "default_runlevels")]
    pub runlevels: Vec<Runlevel>,
}

/// How a sampled value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Cumulative counter, stored as a per-second rate.
    Counter,
    /// Point-in-time value, stored as-is.
    Gauge,
}

/// One control channel metric to sample.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    /// Series name, e.g. "bandwidth.read".
    pub name: String,
    /// Control channel counter query, e.g. "traffic/read".
    pub query: String,
    pub kind: MetricKind,
}

/// Sampler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Sampling tick and bucket granularity. Default: 1s.
    #[serde(default = "default_sampler_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Buckets retained per series. Default: 300.
    #[serde(default = "default_sampler_capacity")]
    pub capacity: usize,

    /// Coarser bucket sizes kept alongside `interval`, each with its own
    /// `capacity` buckets. Default: 1m, 15m, 1h.
    #[serde(
        default = "default_granularities",
        deserialize_with = "deserialize_durations"
    )]
    pub granularities: Vec<Duration>,

    /// Control channel metrics. Default: bandwidth read/written.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricConfig>,

    /// Sample process cpu and memory. Default: true.
    #[serde(default = "default_true")]
    pub resources: bool,

    /// Persisted history from a previous session.
    #[serde(default)]
    pub history_path: Option<PathBuf>,

    /// Backfill history at startup. Default: true.
    #[serde(default = "default_true")]
    pub backfill: bool,

    /// Write history to `history_path` on shutdown. Default: false.
    #[serde(default)]
    pub persist_on_exit: bool,
}

/// Config differ configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfDiffConfig {
    /// Declared configuration file.
    #[serde(default)]
    pub torrc: Option<PathBuf>,

    /// Validation pass interval. Default: 30s.
    #[serde(default = "default_confdiff_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Alternative key spellings mapped to their canonical key.
    #[serde(default = "default_aliases")]
    pub aliases: HashMap<String, String>,

    /// Keys that may repeat and take comma separated values.
    #[serde(default = "default_multi_value")]
    pub multi_value: Vec<String>,
}

/// Snapshot scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Refresh tick. Default: 1s.
    #[serde(default = "default_snapshot_tick", with = "humantime_serde")]
    pub tick: Duration,

    /// In-flight producer cycles older than this are reported stale. Default: 250ms.
    #[serde(default = "default_snapshot_deadline", with = "humantime_serde")]
    pub deadline: Duration,

    /// Values older than `max_age_factor` producer intervals are stale. Default: 3.
    #[serde(default = "default_max_age_factor")]
    pub max_age_factor: u32,

    /// Export the final snapshot as JSON on shutdown.
    #[serde(default)]
    pub export_path: Option<PathBuf>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Empty disables the server. Default: ":9091".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_process_name() -> String {
    "tor".to_string()
}

fn default_true() -> bool {
    true
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_control_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_resolver_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_resolver_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_tolerance() -> u32 {
    3
}

fn default_slow_fraction() -> f64 {
    0.5
}

fn default_max_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_fast_streak() -> u32 {
    3
}

fn default_event_capacity() -> usize {
    1000
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(60)
}

fn default_dedup_prefixes() -> HashMap<Runlevel, Vec<String>> {
    let notice = [
        "We stalled too much while trying to write",
        "I learned some more directory information, but not enough to build a circuit",
        "Attempt by ",
        "*Loading relay descriptors.",
        "Average packaged cell fullness:",
        "Heartbeat: Tor's uptime is",
        "Circuit handshake stats since last time:",
        "Rate limiting NEWNYM request",
    ];
    let warn = [
        "You specified a server ",
        "I have no descriptor for the router named",
        "Controller gave us config lines that didn't validate",
        "Problem bootstrapping. Stuck at",
        "*missing key,",
    ];

    let mut prefixes = HashMap::new();
    prefixes.insert(
        Runlevel::Notice,
        notice.iter().map(|s| (*s).to_string()).collect(),
    );
    prefixes.insert(
        Runlevel::Warn,
        warn.iter().map(|s| (*s).to_string()).collect(),
    );
    prefixes
}

fn default_max_filters() -> usize {
    5
}

fn default_runlevels() -> Vec<Runlevel> {
    vec![Runlevel::Notice, Runlevel::Warn, Runlevel::Err]
}

fn default_sampler_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_sampler_capacity() -> usize {
    300
}

fn default_granularities() -> Vec<Duration> {
    vec![
        Duration::from_secs(60),
        Duration::from_secs(15 * 60),
        Duration::from_secs(60 * 60),
    ]
}

fn deserialize_durations<'de, D>(d: D) -> std::result::Result<Vec<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Vec::<humantime_serde::Serde<Duration>>::deserialize(d)?;
    Ok(raw.into_iter().map(humantime_serde::Serde::into_inner).collect())
}

fn default_metrics() -> Vec<MetricConfig> {
    vec![
        MetricConfig {
            name: "bandwidth.read".to_string(),
            query: "traffic/read".to_string(),
            kind: MetricKind::Counter,
        },
        MetricConfig {
            name: "bandwidth.written".to_string(),
            query: "traffic/written".to_string(),
            kind: MetricKind::Counter,
        },
    ]
}

fn default_confdiff_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_aliases() -> HashMap<String, String> {
    [
        ("l", "Log"),
        ("min", "RunAsDaemon"),
        ("BandwidthRateBytes", "BandwidthRate"),
        ("BandwidthBurstBytes", "BandwidthBurst"),
        ("DirFetchPostPeriod", "StatusFetchPeriod"),
        ("MaxConn", "ConnLimit"),
        ("ORBindAddress", "ORListenAddress"),
        ("DirBindAddress", "DirListenAddress"),
        ("SocksBindAddress", "SocksListenAddress"),
        ("UseHelperNodes", "UseEntryGuards"),
        ("NumHelperNodes", "NumEntryGuards"),
        ("UseEntryNodes", "UseEntryGuards"),
        ("NumEntryNodes", "NumEntryGuards"),
        ("ResolvConf", "ServerDNSResolvConfFile"),
        ("SearchDomains", "ServerDNSSearchDomains"),
        ("ServerDNSAllowBrokenResolvConf", "ServerDNSAllowBrokenConfig"),
        ("PreferTunnelledDirConns", "PreferTunneledDirConns"),
        ("BridgeAuthoritativeDirectory", "BridgeAuthoritativeDir"),
        ("StrictEntryNodes", "StrictNodes"),
        ("StrictExitNodes", "StrictNodes"),
    ]
    .into_iter()
    .map(|(alias, key)| (alias.to_string(), key.to_string()))
    .collect()
}

fn default_multi_value() -> Vec<String> {
    [
        "AlternateBridgeAuthority",
        "AlternateDirAuthority",
        "AutomapHostsSuffixes",
        "Bridge",
        "ControlListenAddress",
        "ControlPort",
        "DirListenAddress",
        "DirPolicy",
        "DirAuthority",
        "DNSListenAddress",
        "ExitPolicy",
        "HashedControlPassword",
        "HiddenServiceDir",
        "HiddenServiceOptions",
        "HiddenServicePort",
        "HiddenServiceVersion",
        "HiddenServiceAuthorizeClient",
        "HidServAuth",
        "Log",
        "MapAddress",
        "NatdListenAddress",
        "NodeFamily",
        "ORListenAddress",
        "ORPort",
        "ReachableAddresses",
        "ReachableDirAddresses",
        "ReachableORAddresses",
        "SocksListenAddress",
        "SocksPolicy",
        "SocksPort",
        "TransListenAddress",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_snapshot_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_snapshot_deadline() -> Duration {
    Duration::from_millis(250)
}

fn default_max_age_factor() -> u32 {
    3
}

fn default_health_addr() -> String {
    ":9091".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            process: ProcessConfig::default(),
            control: ControlConfig::default(),
            resolver: ResolverConfig::default(),
            events: EventsConfig::default(),
            sampler: SamplerConfig::default(),
            confdiff: ConfDiffConfig::default(),
            snapshot: SnapshotConfig::default(),
            health: HealthConfig::default(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            name: default_process_name(),
            pid: None,
            role: Role::default(),
            log_file: None,
            state_file: None,
            control_port: None,
            or_port: None,
            dir_port: None,
            socks_port: None,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            timeout: default_control_timeout(),
            reconnect: true,
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
            interval: default_resolver_interval(),
            timeout: default_resolver_timeout(),
            failure_tolerance: default_failure_tolerance(),
            slow_fraction: default_slow_fraction(),
            max_interval: default_max_interval(),
            fast_streak: default_fast_streak(),
            lookups: false,
            resolve_apps: true,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
            dedup_window: default_dedup_window(),
            dedup_prefixes: default_dedup_prefixes(),
            filters: Vec::new(),
            max_filters: default_max_filters(),
            runlevels: default_runlevels(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: default_sampler_interval(),
            capacity: default_sampler_capacity(),
            granularities: default_granularities(),
            metrics: default_metrics(),
            resources: true,
            history_path: None,
            backfill: true,
            persist_on_exit: false,
        }
    }
}

impl Default for ConfDiffConfig {
    fn default() -> Self {
        Self {
            torrc: None,
            interval: default_confdiff_interval(),
            aliases: default_aliases(),
            multi_value: default_multi_value(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            tick: default_snapshot_tick(),
            deadline: default_snapshot_deadline(),
            max_age_factor: default_max_age_factor(),
            export_path: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.process.name.is_empty() {
            bail!("process.name is required");
        }

        if self.process.pid == Some(0) {
            bail!("process.pid must be positive");
        }

        if self.control.timeout.is_zero() {
            bail!("control.timeout must be positive");
        }

        let resolver = &self.resolver;
        if resolver.interval.is_zero() {
            bail!("resolver.interval must be positive");
        }
        if resolver.timeout.is_zero() {
            bail!("resolver.timeout must be positive");
        }
        if resolver.failure_tolerance == 0 {
            bail!("resolver.failure_tolerance must be positive");
        }
        if !(resolver.slow_fraction > 0.0 && resolver.slow_fraction <= 1.0) {
            bail!("resolver.slow_fraction must be in (0, 1]");
        }
        if resolver.max_interval < resolver.interval {
            bail!("resolver.max_interval must not be below resolver.interval");
        }
        if resolver.fast_streak == 0 {
            bail!("resolver.fast_streak must be positive");
        }

        let mut seen = HashSet::new();
        for kind in &resolver.strategies {
            if !seen.insert(*kind) {
                bail!("resolver strategy listed more than once: {kind}");
            }
        }

        if self.events.capacity == 0 {
            bail!("events.capacity must be positive");
        }
        if self.events.max_filters == 0 {
            bail!("events.max_filters must be positive");
        }
        for pattern in &self.events.filters {
            Regex::new(pattern)
                .with_context(|| format!("invalid events.filters pattern: {pattern}"))?;
        }

        if self.sampler.interval.is_zero() {
            bail!("sampler.interval must be positive");
        }
        if self.sampler.capacity == 0 {
            bail!("sampler.capacity must be positive");
        }
        if self.sampler.granularities.iter().any(Duration::is_zero) {
            bail!("sampler.granularities must be positive");
        }
        let mut names = HashSet::new();
        for metric in &self.sampler.metrics {
            if metric.name.is_empty() || metric.query.is_empty() {
                bail!("sampler metric entries need both name and query");
            }
            if !names.insert(metric.name.as_str()) {
                bail!("sampler metric appears more than once: {}", metric.name);
            }
        }
        if self.sampler.persist_on_exit && self.sampler.history_path.is_none() {
            bail!("sampler.persist_on_exit requires sampler.history_path");
        }

        if self.confdiff.interval.is_zero() {
            bail!("confdiff.interval must be positive");
        }

        if self.snapshot.tick.is_zero() {
            bail!("snapshot.tick must be positive");
        }
        if self.snapshot.deadline >= self.snapshot.tick {
            bail!(
                "snapshot.deadline {:?} must be shorter than snapshot.tick {:?}",
                self.snapshot.deadline,
                self.snapshot.tick
            );
        }
        if self.snapshot.max_age_factor == 0 {
            bail!("snapshot.max_age_factor must be positive");
        }

        Ok(())
    }
}
