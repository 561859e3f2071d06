pub mod local;
pub mod scripted;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::CollectError;
use crate::events::entry::Runlevel;
use crate::resolver::directory::RelayEntry;

pub use local::LocalChannel;
pub use scripted::ScriptedChannel;

/// Capacity of an event subscription's channel.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Connection state of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Disconnected,
}

/// One record pushed by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A structured log event.
    Log {
        runlevel: Runlevel,
        message: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// An unparsed daemon log line, possibly part of a multi-line record.
    RawLine(String),
    /// Bytes read and written during the last second.
    Bandwidth { read: u64, written: u64 },
    StatusChanged(ChannelStatus),
}

/// Lazy, unbounded stream of daemon events. Ends when the channel closes.
pub type EventSubscription = mpsc::Receiver<ControlEvent>;

/// Point-in-time queries against the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    Pid,
    ConfigText,
    /// Cumulative counter by name, e.g. `traffic/read`.
    Counter(String),
    RelayDirectory,
    ListenerPorts,
}

impl Query {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &str {
        match self {
            Query::Pid => "pid",
            Query::ConfigText => "config_text",
            Query::Counter(name) => name,
            Query::RelayDirectory => "relay_directory",
            Query::ListenerPorts => "listener_ports",
        }
    }
}

/// Ports the daemon listens on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerPorts {
    pub control: Option<u16>,
    pub or: Option<u16>,
    pub dir: Option<u16>,
    pub socks: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Pid(u32),
    ConfigText(String),
    Counter(u64),
    RelayDirectory(Vec<RelayEntry>),
    ListenerPorts(ListenerPorts),
}

/// Event and query interface to the monitored daemon.
pub trait ControlChannel: Send + Sync {
    /// Subscribe to events at the given runlevels.
    fn subscribe(
        &self,
        runlevels: &[Runlevel],
    ) -> impl Future<Output = Result<EventSubscription, CollectError>> + Send;

    /// Issue a point-in-time query.
    fn request(&self, query: Query) -> impl Future<Output = Result<Reply, CollectError>> + Send;

    /// The daemon log at `path` was read up to byte `offset`. Channels that
    /// follow that log continue from there on their next subscription.
    fn log_read_up_to(&self, _path: &Path, _offset: u64) {}
}

/// Wraps a control channel so every call is bounded by a timeout.
pub struct Guarded<C> {
    inner: Arc<C>,
    timeout: Duration,
}

impl<C> Clone for Guarded<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            timeout: self.timeout,
        }
    }
}

impl<C: ControlChannel> Guarded<C> {
    pub fn new(inner: Arc<C>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn log_read_up_to(&self, path: &Path, offset: u64) {
        self.inner.log_read_up_to(path, offset);
    }

    pub async fn subscribe(
        &self,
        runlevels: &[Runlevel],
    ) -> Result<EventSubscription, CollectError> {
        tokio::time::timeout(self.timeout, self.inner.subscribe(runlevels))
            .await
            .map_err(|_| CollectError::timeout("event subscription", self.timeout))?
    }

    pub async fn request(&self, query: Query) -> Result<Reply, CollectError> {
        let what = format!("control query {}", query.label());
        tokio::time::timeout(self.timeout, self.inner.request(query))
            .await
            .map_err(|_| CollectError::timeout(what, self.timeout))?
    }

    pub async fn pid(&self) -> Result<u32, CollectError> {
        match self.request(Query::Pid).await? {
            Reply::Pid(pid) => Ok(pid),
            other => Err(unexpected("pid", &other)),
        }
    }

    pub async fn config_text(&self) -> Result<String, CollectError> {
        match self.request(Query::ConfigText).await? {
            Reply::ConfigText(text) => Ok(text),
            other => Err(unexpected("config_text", &other)),
        }
    }

    pub async fn counter(&self, name: &str) -> Result<u64, CollectError> {
        match self.request(Query::Counter(name.to_string())).await? {
            Reply::Counter(value) => Ok(value),
            other => Err(unexpected(name, &other)),
        }
    }

    pub async fn relay_directory(&self) -> Result<Vec<RelayEntry>, CollectError> {
        match self.request(Query::RelayDirectory).await? {
            Reply::RelayDirectory(entries) => Ok(entries),
            other => Err(unexpected("relay_directory", &other)),
        }
    }

    pub async fn listener_ports(&self) -> Result<ListenerPorts, CollectError> {
        match self.request(Query::ListenerPorts).await? {
            Reply::ListenerPorts(ports) => Ok(ports),
            other => Err(unexpected("listener_ports", &other)),
        }
    }
}

fn unexpected(query: &str, reply: &Reply) -> CollectError {
    CollectError::parse(format!("control query {query}"), format!("unexpected reply {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_guarded_request_times_out() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.set_delay(Query::Pid, Duration::from_secs(30));
        channel.set_reply(Query::Pid, Reply::Pid(42));

        let guarded = Guarded::new(channel, Duration::from_secs(1));
        let err = guarded.pid().await.expect_err("should time out");
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn test_guarded_typed_reply() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.set_reply(Query::Pid, Reply::Pid(42));
        channel.set_reply(Query::Counter("traffic/read".into()), Reply::Counter(7));

        let guarded = Guarded::new(channel, Duration::from_secs(1));
        assert_eq!(guarded.pid().await.expect("pid"), 42);
        assert_eq!(guarded.counter("traffic/read").await.expect("counter"), 7);
    }

    #[tokio::test]
    async fn test_guarded_mismatched_reply_is_parse_error() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.set_reply(Query::Pid, Reply::Counter(1));

        let guarded = Guarded::new(channel, Duration::from_secs(1));
        let err = guarded.pid().await.expect_err("mismatched reply");
        assert_eq!(err.kind(), "parse_error");
    }
}
