use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Where a bucket's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Live,
    Backfill,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bucket {
    value: f64,
    origin: Origin,
    samples: u32,
}

impl Bucket {
    fn new(value: f64, origin: Origin) -> Self {
        Self {
            value,
            origin,
            samples: 1,
        }
    }

    fn absorb(&mut self, value: f64) {
        let n = f64::from(self.samples);
        self.value = (self.value * n + value) / (n + 1.0);
        self.samples += 1;
    }
}

/// One backfilled value covering the `span` that ends at `at`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackfillPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
    pub span: Duration,
}

/// One bucket as exposed to readers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplePoint {
    pub timestamp: DateTime<Utc>,
    /// `None` means no data, which is distinct from zero.
    pub value: Option<f64>,
    pub origin: Option<Origin>,
}

/// Bounded per-metric series bucketed at a fixed tick.
///
/// Buckets are indexed by `timestamp / tick`, so samples from sources with a
/// different native interval land on the series' own grid. Buckets with no
/// sample stay empty. Live samples always win over backfilled ones.
#[derive(Debug, Clone)]
pub struct Series {
    tick_ms: i64,
    capacity: usize,
    /// Bucket index of `slots[0]`.
    start: i64,
    slots: VecDeque<Option<Bucket>>,
}

impl Series {
    pub fn new(tick: Duration, capacity: usize) -> Self {
        Self {
            tick_ms: i64::try_from(tick.as_millis()).unwrap_or(i64::MAX).max(1),
            capacity: capacity.max(1),
            start: 0,
            slots: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms as u64)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp_millis().div_euclid(self.tick_ms)
    }

    fn time_of(&self, index: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(index.saturating_mul(self.tick_ms))
            .single()
            .unwrap_or_default()
    }

    /// Slot for a bucket index, growing the series as needed. Returns `None`
    /// for buckets older than the retained window.
    fn slot(&mut self, index: i64) -> Option<&mut Option<Bucket>> {
        if self.slots.is_empty() {
            self.start = index;
            self.slots.push_back(None);
            return self.slots.back_mut();
        }

        if index < self.start {
            let gap = usize::try_from(self.start - index).ok()?;
            if self.slots.len() + gap > self.capacity {
                return None;
            }
            for _ in 0..gap {
                self.slots.push_front(None);
            }
            self.start = index;
            return self.slots.front_mut();
        }

        let offset = usize::try_from(index - self.start).ok()?;
        if offset < self.slots.len() {
            return self.slots.get_mut(offset);
        }

        if offset - self.slots.len() >= self.capacity {
            // The whole window is older than this sample.
            self.slots.clear();
            self.start = index;
            self.slots.push_back(None);
            return self.slots.back_mut();
        }

        while self.slots.len() <= offset {
            self.slots.push_back(None);
        }
        while self.slots.len() > self.capacity {
            self.slots.pop_front();
            self.start += 1;
        }
        self.slots.back_mut()
    }

    /// Record a live sample. Several live samples in one bucket are
    /// averaged; a backfilled value in the bucket is replaced.
    pub fn record_live(&mut self, at: DateTime<Utc>, value: f64) -> bool {
        let index = self.index_of(at);
        let Some(slot) = self.slot(index) else {
            return false;
        };
        match slot {
            Some(bucket) if bucket.origin == Origin::Live => bucket.absorb(value),
            _ => *slot = Some(Bucket::new(value, Origin::Live)),
        }
        true
    }

    /// Merge backfilled values by timestamp. Buckets that already hold a
    /// live sample are left alone. Returns the number of buckets written.
    pub fn merge_backfill(&mut self, points: &[BackfillPoint]) -> usize {
        let mut sorted: Vec<&BackfillPoint> =
            points.iter().filter(|p| p.value.is_finite()).collect();
        sorted.sort_by_key(|p| p.at);

        let Some(newest) = sorted.last().map(|p| self.index_of(p.at)) else {
            return 0;
        };
        let newest = if self.slots.is_empty() {
            newest
        } else {
            newest.max(self.start + self.slots.len() as i64 - 1)
        };
        let floor = newest - self.capacity as i64 + 1;

        let mut written = 0;
        for point in sorted {
            let end = self.index_of(point.at);
            let span = i64::try_from(point.span.as_millis()).unwrap_or(i64::MAX) / self.tick_ms;
            let first = (end - span.max(1) + 1).max(floor);

            for index in first..=end {
                let Some(slot) = self.slot(index) else {
                    continue;
                };
                match slot {
                    Some(bucket) if bucket.origin == Origin::Live => {}
                    Some(bucket) => bucket.absorb(point.value),
                    None => {
                        *slot = Some(Bucket::new(point.value, Origin::Backfill));
                        written += 1;
                    }
                }
            }
        }
        written
    }

    /// Every retained bucket, oldest first.
    pub fn points(&self) -> Vec<SamplePoint> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| SamplePoint {
                timestamp: self.time_of(self.start + i as i64),
                value: slot.map(|b| b.value),
                origin: slot.map(|b| b.origin),
            })
            .collect()
    }

    /// Buckets holding a value, oldest first.
    pub fn values(&self) -> Vec<(DateTime<Utc>, f64)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|b| (self.time_of(self.start + i as i64), b.value)))
            .collect()
    }

    pub fn latest(&self) -> Option<f64> {
        self.slots.iter().rev().find_map(|s| s.map(|b| b.value))
    }

    pub fn total(&self) -> f64 {
        self.slots.iter().flatten().map(|b| b.value).sum()
    }

    /// Mean over buckets that hold data.
    pub fn average(&self) -> Option<f64> {
        let count = self.slots.iter().flatten().count();
        (count > 0).then(|| self.total() / count as f64)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
