use std::io;

use thiserror::Error;

/// Failure taxonomy shared by every producer.
///
/// Producers never let these escape their worker loop: a failed cycle turns
/// into a stale-flagged publication plus, once fallbacks are exhausted, a
/// diagnostic in the internal event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    #[error("{tool} is unavailable: {detail}")]
    ToolUnavailable { tool: String, detail: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{what} timed out after {millis}ms")]
    Timeout { what: String, millis: u64 },

    #[error("unable to parse {source_name} output: {detail}")]
    ParseError { source_name: String, detail: String },

    #[error("control channel closed")]
    ChannelClosed,

    #[error("configuration unavailable: {0}")]
    ConfigUnavailable(String),
}

/// Errors raised by connection resolution strategies.
pub type ResolutionError = CollectError;

impl CollectError {
    /// Short stable label, used for metric labels and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolUnavailable { .. } => "tool_unavailable",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Timeout { .. } => "timeout",
            Self::ParseError { .. } => "parse_error",
            Self::ChannelClosed => "channel_closed",
            Self::ConfigUnavailable(_) => "config_unavailable",
        }
    }

    pub fn parse(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ParseError {
            source_name: source_name.into(),
            detail: detail.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            millis: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Map an I/O failure from spawning or reading a facility.
    pub fn from_io(tool: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::ToolUnavailable {
                tool: tool.to_string(),
                detail: err.to_string(),
            },
            io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{tool}: {err}"))
            }
            io::ErrorKind::TimedOut => Self::Timeout {
                what: tool.to_string(),
                millis: 0,
            },
            _ => Self::ToolUnavailable {
                tool: tool.to_string(),
                detail: err.to_string(),
            },
        }
    }
}
