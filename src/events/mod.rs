//! Event stream normalization: daemon log lines and internal diagnostics are
//! assembled, timestamped, deduplicated and kept in a bounded buffer.

pub mod buffer;
pub mod daemon_log;
pub mod entry;
pub mod filter;
pub mod normalizer;
pub mod stats;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, warn};

pub use buffer::{BufferStats, InsertOutcome, LogBuffer};
pub use entry::{Diagnostic, LogEvent, Runlevel, Source};
pub use filter::LogFilters;
pub use normalizer::{DedupRules, LineAssembler};
pub use stats::RunlevelStats;

use crate::config::EventsConfig;
use crate::control::{ChannelStatus, ControlEvent};

/// Requests from the renderer to the event producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventCommand {
    /// Select a regex filter, or clear it with `None`.
    Select(Option<String>),
    /// Drop every buffered event.
    Clear,
}

/// What a single control event turned into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ingested {
    Stored(InsertOutcome),
    /// A multi-line record is still being assembled.
    Pending,
    /// Below the subscribed runlevels.
    Ignored,
    Bandwidth { read: u64, written: u64 },
    Status(ChannelStatus),
}

/// Immutable view of the event buffer handed to the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EventsView {
    pub events: Arc<[LogEvent]>,
    /// Events passing the current selection; same as `events` without one.
    pub filtered: Arc<[LogEvent]>,
    pub selection: Option<String>,
    pub recent_filters: Vec<String>,
    pub stats: BufferStats,
}

/// Owns the log buffer and everything that feeds it.
pub struct EventNormalizer {
    buffer: LogBuffer,
    filters: LogFilters,
    assembler: LineAssembler,
    runlevels: HashSet<Runlevel>,
    stats: Arc<RunlevelStats>,
    filtered: Option<Arc<[LogEvent]>>,
}

impl EventNormalizer {
    pub fn new(cfg: &EventsConfig) -> Self {
        Self {
            buffer: LogBuffer::new(
                cfg.capacity,
                cfg.dedup_window,
                DedupRules::new(cfg.dedup_prefixes.clone()),
            ),
            filters: LogFilters::new(&cfg.filters, cfg.max_filters),
            assembler: LineAssembler::new(),
            runlevels: cfg.runlevels.iter().copied().collect(),
            stats: Arc::new(RunlevelStats::new()),
            filtered: None,
        }
    }

    /// Per-runlevel counters, shared with the periodic reporter.
    pub fn runlevel_stats(&self) -> Arc<RunlevelStats> {
        Arc::clone(&self.stats)
    }

    /// Normalize one event from the control channel. `now` stamps events
    /// without a timestamp of their own and anchors the year of log lines.
    pub fn ingest<Tz: TimeZone>(&mut self, event: ControlEvent, now: &DateTime<Tz>) -> Ingested {
        match event {
            ControlEvent::Log {
                runlevel,
                message,
                timestamp,
            } => {
                let at = timestamp.unwrap_or_else(|| now.with_timezone(&Utc));
                self.store_daemon(LogEvent::daemon(runlevel, at, message))
            }
            ControlEvent::RawLine(line) => match self.assembler.push(&line, now) {
                Some(record) => self.store_daemon(record),
                None => Ingested::Pending,
            },
            ControlEvent::Bandwidth { read, written } => Ingested::Bandwidth { read, written },
            ControlEvent::StatusChanged(status) => {
                // A record cut off by a disconnect is complete as it is.
                self.flush_pending();
                let message = match status {
                    ChannelStatus::Connected => "Control channel connected",
                    ChannelStatus::Disconnected => "Control channel disconnected",
                };
                self.push_diagnostic(Diagnostic::notice(message), now.with_timezone(&Utc));
                Ingested::Status(status)
            }
        }
    }

    fn store_daemon(&mut self, event: LogEvent) -> Ingested {
        if !self.runlevels.contains(&event.runlevel) {
            return Ingested::Ignored;
        }
        self.stats.record(event.runlevel);
        Ingested::Stored(self.insert(event))
    }

    fn insert(&mut self, event: LogEvent) -> InsertOutcome {
        self.filtered = None;
        self.buffer.insert(event)
    }

    /// Complete a multi-line record whose terminator never arrived.
    pub fn flush_pending(&mut self) -> Option<InsertOutcome> {
        let record = self.assembler.flush()?;
        match self.store_daemon(record) {
            Ingested::Stored(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Append a collector-generated event.
    pub fn push_diagnostic(&mut self, diagnostic: Diagnostic, at: DateTime<Utc>) -> InsertOutcome {
        self.insert(diagnostic.into_event(at))
    }

    /// Seed the buffer with events read before the subscription started.
    pub fn prepopulate(&mut self, events: Vec<LogEvent>) -> usize {
        let mut stored = 0;
        for event in events {
            if self.runlevels.contains(&event.runlevel) {
                self.insert(event);
                stored += 1;
            }
        }
        debug!(stored, "prepopulated event buffer");
        stored
    }

    /// Apply a renderer request.
    pub fn apply(&mut self, command: EventCommand, now: DateTime<Utc>) {
        match command {
            EventCommand::Clear => {
                self.buffer.clear();
                self.filtered = None;
            }
            EventCommand::Select(pattern) => {
                if let Err(e) = self.filters.select(pattern.as_deref()) {
                    let pattern = pattern.unwrap_or_default();
                    warn!(pattern = %pattern, error = %e, "invalid event filter");
                    self.push_diagnostic(
                        Diagnostic::notice(format!(
                            "Invalid regular expression pattern ({pattern}): {e}"
                        )),
                        now,
                    );
                }
                self.filtered = None;
            }
        }
    }

    pub fn view(&mut self) -> EventsView {
        let events = self.buffer.view();

        let filtered = if self.filters.selection().is_none() {
            Arc::clone(&events)
        } else if let Some(cached) = &self.filtered {
            Arc::clone(cached)
        } else {
            let matched: Arc<[LogEvent]> = self.filters.apply(&events).cloned().collect();
            self.filtered = Some(Arc::clone(&matched));
            matched
        };

        EventsView {
            events,
            filtered,
            selection: self.filters.selection().map(str::to_string),
            recent_filters: self.filters.latest_selections(),
            stats: self.buffer.stats(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn config(capacity: usize) -> EventsConfig {
        EventsConfig {
            capacity,
            dedup_window: Duration::from_secs(60),
            dedup_prefixes: HashMap::new(),
            filters: Vec::new(),
            max_filters: 5,
            runlevels: vec![Runlevel::Notice, Runlevel::Warn, Runlevel::Err],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 20, 12, 0, 0).single().expect("valid time")
    }

    fn log(runlevel: Runlevel, message: &str, secs: i64) -> ControlEvent {
        ControlEvent::Log {
            runlevel,
            message: message.into(),
            timestamp: Some(now() + chrono::TimeDelta::seconds(secs)),
        }
    }

    #[test]
    fn test_duplicates_collapse_with_count() {
        let mut n = EventNormalizer::new(&config(100));
        for i in 0..4 {
            n.ingest(log(Runlevel::Notice, "Bootstrapped 100%", i), &now());
        }
        let view = n.view();
        assert_eq!(view.events.len(), 1);
        assert_eq!(view.events[0].repeat, 4);
        assert_eq!(view.stats.collapsed, 3);
    }

    #[test]
    fn test_runlevel_subscription_filters_daemon_events() {
        let mut n = EventNormalizer::new(&config(100));
        assert_eq!(
            n.ingest(log(Runlevel::Debug, "noise", 0), &now()),
            Ingested::Ignored
        );
        assert!(n.is_empty());
    }

    #[test]
    fn test_multiline_record_assembled_before_insert() {
        let mut n = EventNormalizer::new(&config(100));
        let lines = [
            "Jul 20 11:59:00.000 [warn] Problem bootstrapping:",
            "  first detail",
            "  second detail",
            "",
        ];
        let mut results = Vec::new();
        for line in lines {
            results.push(n.ingest(ControlEvent::RawLine(line.into()), &now()));
        }
        assert_eq!(results[..3], [Ingested::Pending; 3]);
        assert_eq!(results[3], Ingested::Stored(InsertOutcome::Inserted));

        let view = n.view();
        assert_eq!(view.events.len(), 1);
        assert!(view.events[0].continuation);
        assert!(view.events[0].message.ends_with("second detail"));
    }

    #[test]
    fn test_filter_matches_multiline_body() {
        let mut n = EventNormalizer::new(&config(100));
        n.ingest(
            ControlEvent::RawLine("Jul 20 11:59:00.000 [warn] header line".into()),
            &now(),
        );
        n.ingest(ControlEvent::RawLine("  body with needle".into()), &now());
        n.flush_pending();
        n.ingest(log(Runlevel::Notice, "unrelated", 5), &now());

        n.apply(EventCommand::Select(Some("header.*needle".into())), now());
        let view = n.view();
        assert_eq!(view.events.len(), 2);
        assert_eq!(view.filtered.len(), 1);
        assert_eq!(view.selection.as_deref(), Some("header.*needle"));
    }

    #[test]
    fn test_invalid_filter_reports_diagnostic_and_keeps_selection() {
        let mut n = EventNormalizer::new(&config(100));
        n.apply(EventCommand::Select(Some("needle".into())), now());
        n.apply(EventCommand::Select(Some("(unclosed".into())), now());

        let view = n.view();
        assert_eq!(view.selection.as_deref(), Some("needle"));
        assert!(view
            .events
            .iter()
            .any(|e| e.source == Source::Internal && e.message.contains("(unclosed")));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut n = EventNormalizer::new(&config(10));
        for i in 0..15 {
            n.ingest(log(Runlevel::Notice, &format!("event {i}"), i), &now());
        }
        let view = n.view();
        assert_eq!(view.events.len(), 10);
        assert_eq!(view.events[0].message, "event 5");
        assert_eq!(view.stats.evicted, 5);
    }

    #[test]
    fn test_status_change_flushes_and_reports() {
        let mut n = EventNormalizer::new(&config(100));
        n.ingest(
            ControlEvent::RawLine("Jul 20 11:59:00.000 [notice] partial".into()),
            &now(),
        );
        let outcome = n.ingest(
            ControlEvent::StatusChanged(ChannelStatus::Disconnected),
            &now(),
        );
        assert_eq!(outcome, Ingested::Status(ChannelStatus::Disconnected));
        assert_eq!(n.len(), 2);
    }

    #[test]
    fn test_clear_and_prepopulate() {
        let mut n = EventNormalizer::new(&config(100));
        let seeded = n.prepopulate(vec![
            LogEvent::daemon(Runlevel::Notice, now(), "from file"),
            LogEvent::daemon(Runlevel::Info, now(), "too verbose"),
        ]);
        assert_eq!(seeded, 1);
        n.apply(EventCommand::Clear, now());
        assert!(n.view().events.is_empty());
    }

    #[test]
    fn test_runlevel_stats_counted() {
        let mut n = EventNormalizer::new(&config(100));
        let stats = n.runlevel_stats();
        n.ingest(log(Runlevel::Warn, "a", 0), &now());
        n.ingest(log(Runlevel::Warn, "b", 1), &now());
        assert_eq!(stats.snapshot(), vec![(Runlevel::Warn, 2)]);
    }
}
