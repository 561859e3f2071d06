//! Assembly of producer outputs into one immutable frame per tick.

pub mod handoff;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use handoff::{Slot, SlotView, StaleReason};

use crate::confdiff::{Classification, ConfigView};
use crate::config::Config;
use crate::events::entry::LogEvent;
use crate::events::EventsView;
use crate::export::health::HealthMetrics;
use crate::resolver::{Connection, ResolverHealth};
use crate::sampler::SamplesView;

/// What the resolver worker publishes each cycle.
#[derive(Debug, Clone)]
pub struct ConnectionsView {
    pub connections: Arc<[Connection]>,
    pub health: ResolverHealth,
}

/// One single-slot handoff per producer.
pub struct Producers {
    pub connections: Slot<ConnectionsView>,
    pub events: Slot<EventsView>,
    pub samples: Slot<SamplesView>,
    pub config: Slot<ConfigView>,
}

impl Producers {
    pub fn new(cfg: &Config) -> Self {
        Self {
            connections: Slot::new("connections", cfg.resolver.interval),
            // Events are pushed; the worker republishes every snapshot tick.
            events: Slot::new("events", cfg.snapshot.tick),
            samples: Slot::new("samples", cfg.sampler.interval),
            config: Slot::new("config", cfg.confdiff.interval),
        }
    }
}

/// Per-producer staleness of a snapshot. `None` means fresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StaleFlags {
    pub connections: Option<StaleReason>,
    pub events: Option<StaleReason>,
    pub samples: Option<StaleReason>,
    pub config: Option<StaleReason>,
}

impl StaleFlags {
    fn all(reason: StaleReason) -> Self {
        Self {
            connections: Some(reason),
            events: Some(reason),
            samples: Some(reason),
            config: Some(reason),
        }
    }

    pub fn any(&self) -> bool {
        self.by_producer().iter().any(|(_, r)| r.is_some())
    }

    pub fn by_producer(&self) -> [(&'static str, Option<StaleReason>); 4] {
        [
            ("connections", self.connections),
            ("events", self.events),
            ("samples", self.samples),
            ("config", self.config),
        ]
    }
}

/// Everything the renderer draws for one tick.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub generation: u64,
    pub taken_at: DateTime<Utc>,
    pub connections: Arc<[Connection]>,
    pub resolver: Option<ResolverHealth>,
    pub events: Arc<[LogEvent]>,
    pub filtered: Arc<[LogEvent]>,
    pub selection: Option<String>,
    pub samples: Arc<SamplesView>,
    pub config: Arc<ConfigView>,
    pub stale: StaleFlags,
}

impl Snapshot {
    /// Frame shown before any producer published.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            taken_at: Utc::now(),
            connections: Arc::from(Vec::new()),
            resolver: None,
            events: Arc::from(Vec::new()),
            filtered: Arc::from(Vec::new()),
            selection: None,
            samples: Arc::new(SamplesView::default()),
            config: Arc::new(ConfigView::default()),
            stale: StaleFlags::all(StaleReason::NoData),
        }
    }

    /// One-line description for headless output.
    pub fn summary(&self) -> String {
        let stale: Vec<&str> = self
            .stale
            .by_producer()
            .iter()
            .filter(|(_, r)| r.is_some())
            .map(|(name, _)| *name)
            .collect();
        let resolver = self
            .resolver
            .as_ref()
            .map_or_else(|| "idle".to_string(), |h| h.state.to_string());

        format!(
            "#{} connections={} ({}) events={} config[match={} overridden={} invalid={} duplicate={}] stale=[{}]",
            self.generation,
            self.connections.len(),
            resolver,
            self.events.len(),
            self.config.count(Classification::Match),
            self.config.count(Classification::OverriddenInFile),
            self.config.count(Classification::Invalid),
            self.config.count(Classification::Duplicate),
            stale.join(","),
        )
    }
}

/// Renderer-side access to the latest snapshot.
#[derive(Clone)]
pub struct SnapshotHandle {
    latest: Arc<ArcSwap<Snapshot>>,
    notify: watch::Receiver<u64>,
}

impl SnapshotHandle {
    /// The most recent snapshot. Never blocks.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.latest.load_full()
    }

    /// Receiver notified with the generation of every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.clone()
    }
}

/// Reads every producer's slot on a fixed tick and publishes the result.
pub struct Coordinator {
    producers: Arc<Producers>,
    latest: Arc<ArcSwap<Snapshot>>,
    notify: watch::Sender<u64>,
    generation: u64,
    deadline: Duration,
    max_age_factor: u32,
    health: Option<Arc<HealthMetrics>>,
}

impl Coordinator {
    pub fn new(producers: Arc<Producers>, cfg: &Config) -> (Self, SnapshotHandle) {
        let latest = Arc::new(ArcSwap::from_pointee(Snapshot::empty()));
        let (notify, rx) = watch::channel(0);

        let coordinator = Self {
            producers,
            latest: Arc::clone(&latest),
            notify,
            generation: 0,
            deadline: cfg.snapshot.deadline,
            max_age_factor: cfg.snapshot.max_age_factor,
            health: None,
        };

        (coordinator, SnapshotHandle { latest, notify: rx })
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    /// Assemble and publish one snapshot from whatever each producer last
    /// published. All slots are read against the same instant.
    pub fn tick(&mut self) -> Arc<Snapshot> {
        let now = Instant::now();
        let (deadline, factor) = (self.deadline, self.max_age_factor);
        let p = &self.producers;

        let connections = p.connections.read(now, deadline, factor);
        let events = p.events.read(now, deadline, factor);
        let samples = p.samples.read(now, deadline, factor);
        let config = p.config.read(now, deadline, factor);

        self.generation += 1;

        let (conns, resolver) = match &connections.value {
            Some(v) => (Arc::clone(&v.connections), Some(v.health.clone())),
            None => (Arc::from(Vec::new()), None),
        };
        let (log, filtered, selection) = match &events.value {
            Some(v) => (
                Arc::clone(&v.events),
                Arc::clone(&v.filtered),
                v.selection.clone(),
            ),
            None => (Arc::from(Vec::new()), Arc::from(Vec::new()), None),
        };

        let snapshot = Arc::new(Snapshot {
            generation: self.generation,
            taken_at: Utc::now(),
            connections: conns,
            resolver,
            events: log,
            filtered,
            selection,
            samples: samples.value.unwrap_or_default(),
            config: config.value.unwrap_or_default(),
            stale: StaleFlags {
                connections: connections.reason,
                events: events.reason,
                samples: samples.reason,
                config: config.reason,
            },
        });

        self.latest.store(Arc::clone(&snapshot));
        self.notify.send_replace(self.generation);

        if let Some(health) = &self.health {
            health.snapshots_published.inc();
            for (producer, reason) in snapshot.stale.by_producer() {
                health
                    .stale_producers
                    .with_label_values(&[producer])
                    .set(if reason.is_some() { 1.0 } else { 0.0 });
            }
        }

        snapshot
    }

    /// Publish on every tick until cancelled.
    pub async fn run(mut self, tick: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(tick = ?tick, "snapshot coordinator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.tick();
                    if snapshot.stale.any() {
                        debug!(
                            generation = snapshot.generation,
                            stale = ?snapshot.stale,
                            "snapshot published with stale producers",
                        );
                    }
                }
            }
        }

        // Final frame reflecting the producers' last publications.
        self.tick();
    }
}
