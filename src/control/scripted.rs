use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ControlChannel, ControlEvent, EventSubscription, Query, Reply, SUBSCRIPTION_BUFFER};
use crate::error::CollectError;
use crate::events::entry::Runlevel;

#[derive(Default)]
struct ScriptState {
    replies: HashMap<Query, Reply>,
    queued: HashMap<Query, VecDeque<Result<Reply, CollectError>>>,
    delays: HashMap<Query, Duration>,
    pending_events: Vec<ControlEvent>,
    subscribe_failures: VecDeque<CollectError>,
    subscribers: Vec<mpsc::Sender<ControlEvent>>,
    subscriptions: u32,
    requests: HashMap<Query, u32>,
}

/// In-memory control channel with injectable replies, failures, delays
/// and events.
#[derive(Default)]
pub struct ScriptedChannel {
    state: Mutex<ScriptState>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to `query` with `reply` until changed.
    pub fn set_reply(&self, query: Query, reply: Reply) {
        self.state.lock().replies.insert(query, reply);
    }

    /// Answer the next `query` with `result`, ahead of the standing reply.
    pub fn push_result(&self, query: Query, result: Result<Reply, CollectError>) {
        self.state
            .lock()
            .queued
            .entry(query)
            .or_default()
            .push_back(result);
    }

    /// Fail the next `query` with `err`.
    pub fn push_failure(&self, query: Query, err: CollectError) {
        self.push_result(query, Err(err));
    }

    /// Delay every answer to `query`.
    pub fn set_delay(&self, query: Query, delay: Duration) {
        self.state.lock().delays.insert(query, delay);
    }

    pub fn clear_delay(&self, query: &Query) {
        self.state.lock().delays.remove(query);
    }

    /// Deliver `event` to the next subscription as soon as it is made.
    pub fn queue_event(&self, event: ControlEvent) {
        self.state.lock().pending_events.push(event);
    }

    /// Push `event` to every open subscription. Returns how many received it.
    pub fn emit(&self, event: ControlEvent) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|tx| tx.try_send(event.clone()).is_ok())
            .count()
    }

    /// End every open subscription.
    pub fn close_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Fail the next subscription attempt with `err`.
    pub fn fail_next_subscribe(&self, err: CollectError) {
        self.state.lock().subscribe_failures.push_back(err);
    }

    /// Number of successful subscriptions so far.
    pub fn subscription_count(&self) -> u32 {
        self.state.lock().subscriptions
    }

    /// Number of times `query` was issued.
    pub fn request_count(&self, query: &Query) -> u32 {
        self.state.lock().requests.get(query).copied().unwrap_or(0)
    }
}

impl ControlChannel for ScriptedChannel {
    fn subscribe(
        &self,
        _runlevels: &[Runlevel],
    ) -> impl Future<Output = Result<EventSubscription, CollectError>> + Send {
        let result = {
            let mut state = self.state.lock();
            match state.subscribe_failures.pop_front() {
                Some(err) => Err(err),
                None => {
                    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
                    for event in state.pending_events.drain(..) {
                        let _ = tx.try_send(event);
                    }
                    state.subscribers.push(tx);
                    state.subscriptions += 1;
                    Ok(rx)
                }
            }
        };

        async move { result }
    }

    fn request(&self, query: Query) -> impl Future<Output = Result<Reply, CollectError>> + Send {
        let (delay, result) = {
            let mut state = self.state.lock();
            *state.requests.entry(query.clone()).or_insert(0) += 1;

            let queued = state
                .queued
                .get_mut(&query)
                .and_then(VecDeque::pop_front);
            let result = match queued {
                Some(result) => result,
                None => state.replies.get(&query).cloned().ok_or_else(|| {
                    CollectError::ConfigUnavailable(format!(
                        "no scripted reply for {}",
                        query.label()
                    ))
                }),
            };
            (state.delays.get(&query).copied(), result)
        };

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }
}
