use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::command::CommandStrategy;
use super::connection::RawConnection;
use super::proc_net::ProcStrategy;
use crate::error::ResolutionError;

/// Future returned by [`Strategy::resolve`].
pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<RawConnection>, ResolutionError>> + Send + 'a>>;

/// OS facility used to enumerate a process's sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Proc,
    Netstat,
    Ss,
    Lsof,
    Sockstat,
    BsdSockstat,
    BsdProcstat,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Proc => "proc",
            StrategyKind::Netstat => "netstat",
            StrategyKind::Ss => "ss",
            StrategyKind::Lsof => "lsof",
            StrategyKind::Sockstat => "sockstat",
            StrategyKind::BsdSockstat => "sockstat (bsd)",
            StrategyKind::BsdProcstat => "procstat (bsd)",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preference order for a platform, most structured facility first.
pub fn platform_defaults(os: &str, proc_available: bool) -> Vec<StrategyKind> {
    let mut kinds = Vec::with_capacity(5);

    if proc_available {
        kinds.push(StrategyKind::Proc);
    }

    match os {
        "freebsd" => kinds.extend([
            StrategyKind::BsdSockstat,
            StrategyKind::BsdProcstat,
            StrategyKind::Lsof,
        ]),
        "openbsd" | "macos" => kinds.push(StrategyKind::Lsof),
        _ => kinds.extend([
            StrategyKind::Netstat,
            StrategyKind::Sockstat,
            StrategyKind::Lsof,
            StrategyKind::Ss,
        ]),
    }

    kinds
}

/// Preference order for the running host.
pub fn host_defaults() -> Vec<StrategyKind> {
    let proc_available = std::fs::metadata("/proc/net/tcp").is_ok();
    platform_defaults(std::env::consts::OS, proc_available)
}

/// One way of answering "what connections does process P hold?".
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Enumerate established connections of `pid`.
    fn resolve<'a>(&'a self, pid: u32, process_name: &'a str) -> ResolveFuture<'a>;
}

/// Construct the built-in strategy for `kind`.
pub fn build_strategy(kind: StrategyKind, timeout: Duration) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::Proc => Box::new(ProcStrategy::new()),
        other => Box::new(CommandStrategy::new(other, timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_defaults() {
        assert_eq!(
            platform_defaults("linux", true),
            vec![
                StrategyKind::Proc,
                StrategyKind::Netstat,
                StrategyKind::Sockstat,
                StrategyKind::Lsof,
                StrategyKind::Ss,
            ]
        );
        assert_eq!(
            platform_defaults("freebsd", false),
            vec![
                StrategyKind::BsdSockstat,
                StrategyKind::BsdProcstat,
                StrategyKind::Lsof,
            ]
        );
        assert_eq!(platform_defaults("macos", false), vec![StrategyKind::Lsof]);
        assert_eq!(platform_defaults("openbsd", false), vec![StrategyKind::Lsof]);
    }

    #[test]
    fn test_build_strategy_kind() {
        for kind in [StrategyKind::Proc, StrategyKind::Ss, StrategyKind::BsdProcstat] {
            assert_eq!(build_strategy(kind, Duration::from_secs(1)).kind(), kind);
        }
    }

    #[test]
    fn test_kind_deserialize() {
        let kinds: Vec<StrategyKind> =
            serde_yaml::from_str("[proc, bsd_sockstat, ss]").expect("valid kinds");
        assert_eq!(
            kinds,
            vec![StrategyKind::Proc, StrategyKind::BsdSockstat, StrategyKind::Ss]
        );
    }
}
