//! Periodic numeric sampling with optional backfill from a previous
//! session's history or the daemon's own state file.

pub mod history;
pub mod resources;
pub mod series;
pub mod state_file;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

pub use history::History;
pub use resources::{ResourceSample, ResourceTracker};
pub use series::{BackfillPoint, Origin, SamplePoint, Series};

use crate::config::{MetricConfig, MetricKind, SamplerConfig};
use crate::control::{ControlChannel, Guarded};
use crate::error::CollectError;
use crate::events::entry::Diagnostic;

/// Series fed by the daemon's state file.
pub const BANDWIDTH_READ: &str = "bandwidth.read";
pub const BANDWIDTH_WRITTEN: &str = "bandwidth.written";

/// Reader-facing copy of one series.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesView {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    pub points: Vec<SamplePoint>,
    pub latest: Option<f64>,
    pub average: Option<f64>,
    pub total: f64,
}

/// Everything the sampler publishes per cycle.
///
/// Each metric appears once per granularity, finest first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SamplesView {
    pub series: Vec<SeriesView>,
    pub resources: Option<ResourceSample>,
}

impl SamplesView {
    /// The finest series for a metric.
    pub fn get(&self, name: &str) -> Option<&SeriesView> {
        self.series.iter().find(|s| s.name == name)
    }

    /// The series for a metric bucketed at exactly `tick`.
    pub fn at_tick(&self, name: &str, tick: Duration) -> Option<&SeriesView> {
        self.series.iter().find(|s| s.name == name && s.tick == tick)
    }

    /// Granularities available for a metric, finest first.
    pub fn ticks(&self, name: &str) -> Vec<Duration> {
        self.series
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.tick)
            .collect()
    }
}

/// Outcome of one sampling cycle.
#[derive(Debug, Default)]
pub struct SampleReport {
    /// Metrics that could not be read, with the reason.
    pub errors: Vec<(String, CollectError)>,
    pub diagnostics: Vec<Diagnostic>,
}

impl SampleReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Owns every series and the state needed to turn counters into rates.
pub struct Sampler {
    /// Bucket sizes, finest first. The first is the sampling tick.
    ticks: Vec<Duration>,
    capacity: usize,
    metrics: Vec<MetricConfig>,
    series: BTreeMap<String, Vec<Series>>,
    counters: HashMap<String, (DateTime<Utc>, u64)>,
    resources: Option<ResourceTracker>,
    latest_resources: Option<ResourceSample>,
    last_pid: Option<u32>,
}

impl Sampler {
    pub fn new(cfg: &SamplerConfig, command_timeout: Duration) -> Self {
        let mut ticks: Vec<Duration> = cfg
            .granularities
            .iter()
            .copied()
            .filter(|g| *g > cfg.interval)
            .collect();
        ticks.sort();
        ticks.dedup();
        ticks.insert(0, cfg.interval);

        let series = cfg
            .metrics
            .iter()
            .map(|m| (m.name.clone(), tiers(&ticks, cfg.capacity)))
            .collect();

        Self {
            ticks,
            capacity: cfg.capacity,
            metrics: cfg.metrics.clone(),
            series,
            counters: HashMap::new(),
            resources: cfg.resources.then(|| ResourceTracker::new(command_timeout)),
            latest_resources: None,
            last_pid: None,
        }
    }

    /// Replace the resource tracker, e.g. to read from another proc mount.
    pub fn with_resources(mut self, tracker: Option<ResourceTracker>) -> Self {
        self.resources = tracker;
        self
    }

    fn tiers_mut(&mut self, name: &str) -> &mut Vec<Series> {
        let (ticks, capacity) = (&self.ticks, self.capacity);
        self.series
            .entry(name.to_string())
            .or_insert_with(|| tiers(ticks, capacity))
    }

    /// Record a live value into every granularity of the metric.
    pub fn record_value(&mut self, name: &str, at: DateTime<Utc>, value: f64) {
        for series in self.tiers_mut(name) {
            series.record_live(at, value);
        }
    }

    /// Record a cumulative counter reading, storing the per-second rate
    /// since the previous reading. Returns the rate, if one could be formed.
    pub fn record_counter(&mut self, name: &str, at: DateTime<Utc>, reading: u64) -> Option<f64> {
        let previous = self.counters.insert(name.to_string(), (at, reading));
        let (prev_at, prev) = previous?;

        let secs = (at - prev_at).num_milliseconds() as f64 / 1000.0;
        if secs <= 0.0 || reading < prev {
            // Counter reset or clock step; start over from this reading.
            return None;
        }

        let rate = (reading - prev) as f64 / secs;
        self.record_value(name, at, rate);
        Some(rate)
    }

    /// Record pushed bandwidth figures (bytes during the last second).
    pub fn record_bandwidth(&mut self, at: DateTime<Utc>, read: u64, written: u64) {
        self.record_value(BANDWIDTH_READ, at, read as f64);
        self.record_value(BANDWIDTH_WRITTEN, at, written as f64);
    }

    /// Merge backfilled points into the granularities at least as coarse
    /// as each point's span. Points coarser than every granularity go to
    /// the coarsest one. Live buckets are kept.
    ///
    /// Returns the buckets written in the finest series that took points.
    pub fn backfill(&mut self, name: &str, points: &[BackfillPoint]) -> usize {
        let tiered = self.tiers_mut(name);
        let coarsest = tiered.last().map(Series::tick).unwrap_or_default();

        let mut written = None;
        for series in tiered.iter_mut() {
            let tick = series.tick();
            let fitting: Vec<BackfillPoint> = points
                .iter()
                .filter(|p| p.span <= tick || tick == coarsest)
                .copied()
                .collect();
            if fitting.is_empty() {
                continue;
            }
            let count = series.merge_backfill(&fitting);
            written.get_or_insert(count);
        }
        written.unwrap_or(0)
    }

    /// Backfill from a previous session's persisted history.
    pub fn backfill_history(&mut self, history: &History) -> usize {
        let tick = self.ticks[0];
        history
            .metrics
            .keys()
            .map(|name| {
                let points = history.points(name, tick);
                self.backfill(name, &points)
            })
            .sum()
    }

    /// Backfill bandwidth from the daemon's state file.
    pub async fn backfill_state_file(&mut self, path: &Path) -> Diagnostic {
        match state_file::read_state_file(path).await {
            Ok(bw) => {
                let read = self.backfill(BANDWIDTH_READ, &bw.read);
                let written = self.backfill(BANDWIDTH_WRITTEN, &bw.written);
                info!(read, written, "bandwidth backfilled from state file");
                Diagnostic::notice("Read the last day of bandwidth history from the state file")
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "state file backfill failed");
                Diagnostic::notice(format!("Unable to prepopulate bandwidth information ({e})"))
            }
        }
    }

    /// Poll every configured metric and the process resources once.
    pub async fn sample<C: ControlChannel>(
        &mut self,
        channel: &Guarded<C>,
        at: DateTime<Utc>,
    ) -> SampleReport {
        let mut report = SampleReport::default();

        for metric in self.metrics.clone() {
            match channel.counter(&metric.query).await {
                Ok(value) => match metric.kind {
                    MetricKind::Counter => {
                        self.record_counter(&metric.name, at, value);
                    }
                    MetricKind::Gauge => self.record_value(&metric.name, at, value as f64),
                },
                Err(e) => report.errors.push((metric.name.clone(), e)),
            }
        }

        if self.resources.as_ref().is_some_and(|r| !r.is_disabled()) {
            match channel.pid().await {
                Ok(pid) => self.sample_resources(pid, at, &mut report).await,
                Err(e) => report.errors.push(("resources".to_string(), e)),
            }
        }

        report
    }

    async fn sample_resources(&mut self, pid: u32, at: DateTime<Utc>, report: &mut SampleReport) {
        let Some(tracker) = self.resources.as_mut() else {
            return;
        };
        if self.last_pid.is_some_and(|p| p != pid) {
            tracker.reset();
        }
        self.last_pid = Some(pid);

        let result = tracker.sample(pid).await;
        if let Some(diagnostic) = tracker.take_diagnostic() {
            report.diagnostics.push(diagnostic);
        }
        match result {
            Ok(sample) => {
                self.record_value("process.cpu", at, sample.cpu_sample);
                self.record_value("process.memory", at, sample.memory_bytes as f64);
                self.latest_resources = Some(sample);
            }
            Err(e) => report.errors.push(("resources".to_string(), e)),
        }
    }

    /// Number of metrics polled from the control channel each cycle.
    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// The finest series for a metric.
    pub fn series(&self, name: &str) -> Option<&Series> {
        self.series.get(name).and_then(|tiers| tiers.first())
    }

    /// The series for a metric bucketed at exactly `tick`.
    pub fn series_at(&self, name: &str, tick: Duration) -> Option<&Series> {
        self.series
            .get(name)
            .and_then(|tiers| tiers.iter().find(|s| s.tick() == tick))
    }

    /// Bucket sizes kept for every metric, finest first.
    pub fn ticks(&self) -> &[Duration] {
        &self.ticks
    }

    /// Snapshot of the finest series for history persistence.
    pub fn history(&self) -> History {
        History::from_series(
            self.series
                .iter()
                .filter_map(|(name, tiers)| tiers.first().map(|s| (name, s))),
        )
    }

    pub fn view(&self) -> SamplesView {
        SamplesView {
            series: self
                .series
                .iter()
                .flat_map(|(name, tiers)| {
                    tiers.iter().map(move |s| SeriesView {
                        name: name.clone(),
                        tick: s.tick(),
                        points: s.points(),
                        latest: s.latest(),
                        average: s.average(),
                        total: s.total(),
                    })
                })
                .collect(),
            resources: self.latest_resources,
        }
    }
}

fn tiers(ticks: &[Duration], capacity: usize) -> Vec<Series> {
    ticks.iter().map(|t| Series::new(*t, capacity)).collect()
}
