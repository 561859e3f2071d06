use std::sync::atomic::{AtomicU64, Ordering};

use super::entry::{Runlevel, RUNLEVEL_COUNT};

/// Lock-free per-runlevel counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct RunlevelStats {
    counts: [AtomicU64; RUNLEVEL_COUNT],
}

impl RunlevelStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given runlevel by one.
    pub fn record(&self, runlevel: Runlevel) {
        if let Some(counter) = self.counts.get(runlevel as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(Runlevel, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(rl) = Runlevel::from_index(i) {
                    result.push((rl, v));
                }
            }
        }

        result
    }
}

impl Default for RunlevelStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = RunlevelStats::new();
        stats.record(Runlevel::Notice);
        stats.record(Runlevel::Notice);
        stats.record(Runlevel::Err);

        let snap = stats.snapshot();
        assert_eq!(snap, vec![(Runlevel::Notice, 2), (Runlevel::Err, 1)]);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = RunlevelStats::new();
        stats.record(Runlevel::Warn);
        assert_eq!(stats.snapshot().len(), 1);
        assert!(stats.snapshot().is_empty());
    }
}
