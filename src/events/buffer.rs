use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::TimeDelta;
use serde::Serialize;

use super::entry::{LogEvent, Runlevel};
use super::normalizer::DedupRules;

/// How far back an out-of-order insertion looks for its same-runlevel
/// predecessor.
const MAX_PREDECESSOR_SCAN: usize = 64;

/// Result of a single insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored as a new entry.
    Inserted,
    /// Folded into its predecessor's repeat count.
    Collapsed,
}

/// Running counters for the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub accepted: u64,
    pub collapsed: u64,
    pub evicted: u64,
}

/// Bounded, time-ordered, deduplicating event buffer.
///
/// Entries are kept oldest first. Each insertion compares the event against
/// the closest earlier entry of the same runlevel; the newest entry per
/// runlevel is tracked by absolute position so the common append path does
/// no scanning.
pub struct LogBuffer {
    entries: VecDeque<LogEvent>,
    capacity: usize,
    window: TimeDelta,
    rules: DedupRules,
    /// Absolute position (evicted + index) of the newest entry per runlevel.
    newest: HashMap<Runlevel, u64>,
    evicted: u64,
    stats: BufferStats,
    cached_view: Option<Arc<[LogEvent]>>,
}

impl LogBuffer {
    pub fn new(capacity: usize, window: std::time::Duration, rules: DedupRules) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            rules,
            newest: HashMap::new(),
            evicted: 0,
            stats: BufferStats::default(),
            cached_view: None,
        }
    }

    /// Insert an event at its timestamp position, collapsing it into its
    /// same-runlevel predecessor when the messages match within the window.
    pub fn insert(&mut self, event: LogEvent) -> InsertOutcome {
        self.stats.accepted += 1;
        self.cached_view = None;

        // Ties go after existing entries, preserving arrival order.
        let pos = self
            .entries
            .partition_point(|e| e.timestamp <= event.timestamp);

        if let Some(pred) = self.predecessor(pos, event.runlevel) {
            let window = self.window;
            let rules = &self.rules;
            if let Some(existing) = self.entries.get_mut(pred) {
                let within = existing
                    .last_seen
                    .checked_add_signed(window)
                    .map_or(true, |limit| event.timestamp <= limit);
                if within && rules.same(event.runlevel, &existing.message, &event.message) {
                    existing.repeat = existing.repeat.saturating_add(event.repeat);
                    if event.last_seen > existing.last_seen {
                        existing.last_seen = event.last_seen;
                    }
                    self.stats.collapsed += 1;
                    return InsertOutcome::Collapsed;
                }
            }
        }

        let runlevel = event.runlevel;
        self.entries.insert(pos, event);

        let abs = self.evicted + pos as u64;
        for slot in self.newest.values_mut() {
            if *slot >= abs {
                *slot += 1;
            }
        }
        let newest = self.newest.entry(runlevel).or_insert(abs);
        if *newest < abs {
            *newest = abs;
        }

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
            self.stats.evicted += 1;
        }
        let floor = self.evicted;
        self.newest.retain(|_, slot| *slot >= floor);

        InsertOutcome::Inserted
    }

    /// Index of the closest entry before `pos` sharing `runlevel`.
    fn predecessor(&self, pos: usize, runlevel: Runlevel) -> Option<usize> {
        if pos == self.entries.len() {
            let abs = *self.newest.get(&runlevel)?;
            return usize::try_from(abs.checked_sub(self.evicted)?).ok();
        }

        (pos.saturating_sub(MAX_PREDECESSOR_SCAN)..pos)
            .rev()
            .find(|&i| self.entries.get(i).is_some_and(|e| e.runlevel == runlevel))
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.newest.clear();
        self.evicted = 0;
        self.cached_view = None;
    }

    /// Immutable copy of the entries, oldest first.
    pub fn view(&mut self) -> Arc<[LogEvent]> {
        if let Some(view) = &self.cached_view {
            return Arc::clone(view);
        }
        let view: Arc<[LogEvent]> = self.entries.iter().cloned().collect();
        self.cached_view = Some(Arc::clone(&view));
        view
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}
