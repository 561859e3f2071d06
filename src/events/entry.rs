use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Daemon severity levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Runlevel {
    Debug = 0,
    Info = 1,
    Notice = 2,
    Warn = 3,
    Err = 4,
}

/// Number of runlevels.
pub const RUNLEVEL_COUNT: usize = 5;

impl Runlevel {
    /// All runlevels, lowest severity first.
    pub const ALL: [Runlevel; RUNLEVEL_COUNT] = [
        Runlevel::Debug,
        Runlevel::Info,
        Runlevel::Notice,
        Runlevel::Warn,
        Runlevel::Err,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Runlevel::Debug => "DEBUG",
            Runlevel::Info => "INFO",
            Runlevel::Notice => "NOTICE",
            Runlevel::Warn => "WARN",
            Runlevel::Err => "ERR",
        }
    }

    /// Parse a runlevel label, case-insensitively. Accepts the long forms
    /// "warning" and "error" as well.
    pub fn parse(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Runlevel::Debug),
            "INFO" => Some(Runlevel::Info),
            "NOTICE" => Some(Runlevel::Notice),
            "WARN" | "WARNING" => Some(Runlevel::Warn),
            "ERR" | "ERROR" => Some(Runlevel::Err),
            _ => None,
        }
    }

    /// Convert from the numeric index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for Runlevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The monitored daemon's own log.
    Daemon,
    /// Generated by the collector itself.
    Internal,
}

/// One normalized event in the log buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub source: Source,
    pub runlevel: Runlevel,
    /// Time of the first occurrence.
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Set when the message was assembled from several lines.
    pub continuation: bool,
    /// Number of occurrences collapsed into this entry (at least 1).
    pub repeat: u32,
    /// Time of the most recent collapsed occurrence.
    pub last_seen: DateTime<Utc>,
}

impl LogEvent {
    /// A single-line daemon event.
    pub fn daemon(
        runlevel: Runlevel,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(Source::Daemon, runlevel, timestamp, message.into())
    }

    /// An event generated by the collector.
    pub fn internal(
        runlevel: Runlevel,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(Source::Internal, runlevel, timestamp, message.into())
    }

    fn new(source: Source, runlevel: Runlevel, timestamp: DateTime<Utc>, message: String) -> Self {
        Self {
            source,
            runlevel,
            timestamp,
            message,
            continuation: false,
            repeat: 1,
            last_seen: timestamp,
        }
    }

    /// Mark the event as assembled from several lines.
    pub fn with_continuation(mut self, continuation: bool) -> Self {
        self.continuation = continuation;
        self
    }
}

/// Human-readable note a producer wants surfaced in the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub runlevel: Runlevel,
    pub message: String,
}

impl Diagnostic {
    pub fn notice(message: impl Into<String>) -> Self {
        Self {
            runlevel: Runlevel::Notice,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            runlevel: Runlevel::Warn,
            message: message.into(),
        }
    }

    /// Convert into an internal event stamped with `at`.
    pub fn into_event(self, at: DateTime<Utc>) -> LogEvent {
        LogEvent::internal(self.runlevel, at, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runlevel_parse() {
        assert_eq!(Runlevel::parse("notice"), Some(Runlevel::Notice));
        assert_eq!(Runlevel::parse("WARN"), Some(Runlevel::Warn));
        assert_eq!(Runlevel::parse("warning"), Some(Runlevel::Warn));
        assert_eq!(Runlevel::parse("err"), Some(Runlevel::Err));
        assert_eq!(Runlevel::parse("trace"), None);
    }

    #[test]
    fn test_runlevel_ordering_and_index() {
        assert!(Runlevel::Debug < Runlevel::Err);
        for (i, rl) in Runlevel::ALL.iter().enumerate() {
            assert_eq!(Runlevel::from_index(i), Some(*rl));
            assert_eq!(*rl as usize, i);
        }
        assert_eq!(Runlevel::from_index(RUNLEVEL_COUNT), None);
    }

    #[test]
    fn test_runlevel_deserialize_uppercase() {
        let rl: Runlevel = serde_yaml::from_str("NOTICE").expect("valid runlevel");
        assert_eq!(rl, Runlevel::Notice);
    }

    #[test]
    fn test_diagnostic_into_event() {
        let now = Utc::now();
        let ev = Diagnostic::warn("All connection resolvers failed").into_event(now);
        assert_eq!(ev.source, Source::Internal);
        assert_eq!(ev.runlevel, Runlevel::Warn);
        assert_eq!(ev.repeat, 1);
        assert_eq!(ev.last_seen, now);
    }
}
