use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Serialize;
use tokio::time::Instant;

/// Why a slot's value is reported stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// Nothing published yet.
    NoData,
    /// The last cycle failed; the value is carried over.
    Failed,
    /// A cycle is in flight past the deadline.
    Overdue,
    /// The value is older than the allowed age.
    Expired,
    /// The producer stopped for good.
    Terminated,
}

struct SlotState<T> {
    value: Option<Arc<T>>,
    published_at: Option<Instant>,
    failed: bool,
    terminated: bool,
}

impl<T> SlotState<T> {
    fn duplicate(&self) -> Self {
        Self {
            value: self.value.clone(),
            published_at: self.published_at,
            failed: self.failed,
            terminated: self.terminated,
        }
    }
}

/// Point-in-time read of a slot.
#[derive(Debug)]
pub struct SlotView<T> {
    pub value: Option<Arc<T>>,
    pub stale: bool,
    pub reason: Option<StaleReason>,
    pub age: Option<Duration>,
}

/// Single-slot "latest value" handoff between one producer and any number
/// of readers.
///
/// Publishing replaces the previous value atomically; nothing queues.
/// Readers never block and never observe a partially written value.
pub struct Slot<T> {
    name: &'static str,
    state: ArcSwap<SlotState<T>>,
    in_flight: ArcSwapOption<Instant>,
    interval_ms: AtomicU64,
}

impl<T> Slot<T> {
    /// Create an empty slot for a producer running every `interval`.
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            state: ArcSwap::from_pointee(SlotState {
                value: None,
                published_at: None,
                failed: false,
                terminated: false,
            }),
            in_flight: ArcSwapOption::empty(),
            interval_ms: AtomicU64::new(duration_ms(interval)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record the start of a producer cycle.
    pub fn begin(&self) {
        self.in_flight.store(Some(Arc::new(Instant::now())));
    }

    /// Publish a fresh value, completing the cycle.
    pub fn publish(&self, value: T) {
        self.store(Some(Arc::new(value)), false);
    }

    /// Publish a value the producer already knows to be degraded.
    pub fn publish_stale(&self, value: T) {
        self.store(Some(Arc::new(value)), true);
    }

    /// Mark the cycle failed, keeping the previous value.
    pub fn fail(&self) {
        let mut next = self.state.load().duplicate();
        next.failed = true;
        self.state.store(Arc::new(next));
        self.in_flight.store(None);
    }

    /// The producer has stopped and will not publish again.
    pub fn terminate(&self) {
        let mut next = self.state.load().duplicate();
        next.terminated = true;
        self.state.store(Arc::new(next));
        self.in_flight.store(None);
    }

    /// Update the producer's expected interval, used for age checks.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(duration_ms(interval), Ordering::Relaxed);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    fn store(&self, value: Option<Arc<T>>, failed: bool) {
        let terminated = self.state.load().terminated;
        self.state.store(Arc::new(SlotState {
            value,
            published_at: Some(Instant::now()),
            failed,
            terminated,
        }));
        self.in_flight.store(None);
    }

    /// Non-blocking read of the latest value with its staleness.
    ///
    /// A value is stale when its cycle failed, when a cycle has been in
    /// flight longer than `deadline`, or when it is older than
    /// `max_age_factor` producer intervals.
    pub fn read(&self, now: Instant, deadline: Duration, max_age_factor: u32) -> SlotView<T> {
        let state = self.state.load();
        let age = state
            .published_at
            .map(|t| now.saturating_duration_since(t));
        let max_age = self.interval().saturating_mul(max_age_factor);

        let overdue = self
            .in_flight
            .load_full()
            .is_some_and(|started| now.saturating_duration_since(*started) > deadline);

        let reason = if state.terminated {
            Some(StaleReason::Terminated)
        } else if state.value.is_none() {
            Some(StaleReason::NoData)
        } else if state.failed {
            Some(StaleReason::Failed)
        } else if overdue {
            Some(StaleReason::Overdue)
        } else if age.is_some_and(|a| a > max_age) {
            Some(StaleReason::Expired)
        } else {
            None
        };

        SlotView {
            value: state.value.clone(),
            stale: reason.is_some(),
            reason,
            age,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_millis(250);

    #[tokio::test(start_paused = true)]
    async fn test_empty_slot_is_stale() {
        let slot: Slot<u32> = Slot::new("test", Duration::from_secs(1));
        let view = slot.read(Instant::now(), DEADLINE, 3);
        assert!(view.stale);
        assert_eq!(view.reason, Some(StaleReason::NoData));
        assert!(view.value.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_overwrites() {
        let slot = Slot::new("test", Duration::from_secs(1));
        slot.publish(1);
        slot.publish(2);
        let view = slot.read(Instant::now(), DEADLINE, 3);
        assert!(!view.stale);
        assert_eq!(view.value.as_deref(), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_keeps_previous_value() {
        let slot = Slot::new("test", Duration::from_secs(1));
        slot.publish(7);
        slot.begin();
        slot.fail();
        let view = slot.read(Instant::now(), DEADLINE, 3);
        assert_eq!(view.value.as_deref(), Some(&7));
        assert_eq!(view.reason, Some(StaleReason::Failed));

        slot.publish(8);
        assert!(!slot.read(Instant::now(), DEADLINE, 3).stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_cycle_is_stale() {
        let slot = Slot::new("test", Duration::from_secs(10));
        slot.publish(1);
        slot.begin();
        assert!(!slot.read(Instant::now(), DEADLINE, 3).stale);

        tokio::time::advance(Duration::from_millis(300)).await;
        let view = slot.read(Instant::now(), DEADLINE, 3);
        assert_eq!(view.reason, Some(StaleReason::Overdue));
        assert_eq!(view.value.as_deref(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_value_is_stale() {
        let slot = Slot::new("test", Duration::from_secs(1));
        slot.publish(1);
        tokio::time::advance(Duration::from_secs(4)).await;
        let view = slot.read(Instant::now(), DEADLINE, 3);
        assert_eq!(view.reason, Some(StaleReason::Expired));

        slot.set_interval(Duration::from_secs(10));
        assert!(!slot.read(Instant::now(), DEADLINE, 3).stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_is_stale_forever() {
        let slot = Slot::new("test", Duration::from_secs(1));
        slot.publish(1);
        slot.terminate();
        slot.publish(2);
        let view = slot.read(Instant::now(), DEADLINE, 3);
        assert_eq!(view.reason, Some(StaleReason::Terminated));
    }
}
