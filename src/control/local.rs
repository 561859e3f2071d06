use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ChannelStatus, ControlChannel, ControlEvent, EventSubscription, ListenerPorts, Query, Reply,
    SUBSCRIPTION_BUFFER,
};
use crate::config::ProcessConfig;
use crate::error::CollectError;
use crate::events::daemon_log::LogFileTail;
use crate::events::entry::Runlevel;
use crate::pid::NameDiscovery;

/// How often the followed log file is checked for new lines.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Control channel backed only by local facilities: process discovery
/// through /proc, events from the daemon's log file and I/O counters from
/// /proc/<pid>/io.
///
/// It cannot see the running configuration or the relay directory; those
/// queries fail with `ConfigUnavailable`.
pub struct LocalChannel {
    process_name: String,
    fixed_pid: Option<u32>,
    log_file: Option<PathBuf>,
    /// Where the next subscription starts reading the log, once.
    resume_at: Mutex<Option<u64>>,
    ports: ListenerPorts,
}

impl LocalChannel {
    pub fn new(cfg: &ProcessConfig) -> Self {
        Self {
            process_name: cfg.name.clone(),
            fixed_pid: cfg.pid,
            log_file: cfg.log_file.clone(),
            resume_at: Mutex::new(None),
            ports: ListenerPorts {
                control: cfg.control_port,
                or: cfg.or_port,
                dir: cfg.dir_port,
                socks: cfg.socks_port,
            },
        }
    }

    async fn find_pid(&self) -> Result<u32, CollectError> {
        let name = self.process_name.clone();
        let fixed = self.fixed_pid;

        let found = tokio::task::spawn_blocking(move || NameDiscovery::new(name, fixed).find())
            .await
            .map_err(|e| CollectError::ToolUnavailable {
                tool: "process discovery".into(),
                detail: e.to_string(),
            })?;

        match found {
            Ok(Some(pid)) => Ok(pid),
            Ok(None) => Err(CollectError::ToolUnavailable {
                tool: "process discovery".into(),
                detail: format!("no process named {}", self.process_name),
            }),
            Err(e) => Err(CollectError::ToolUnavailable {
                tool: "process discovery".into(),
                detail: format!("{e:#}"),
            }),
        }
    }

    async fn read_counter(&self, name: &str) -> Result<u64, CollectError> {
        let field = match name {
            "traffic/read" => "rchar",
            "traffic/written" => "wchar",
            other => {
                return Err(CollectError::ConfigUnavailable(format!(
                    "counter {other} is not available locally"
                )))
            }
        };

        let pid = self.find_pid().await?;
        let path = format!("/proc/{pid}/io");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CollectError::from_io(&path, &e))?;

        parse_proc_io(&content, field)
            .ok_or_else(|| CollectError::parse(path, format!("missing {field} field")))
    }
}

impl ControlChannel for LocalChannel {
    fn subscribe(
        &self,
        _runlevels: &[Runlevel],
    ) -> impl Future<Output = Result<EventSubscription, CollectError>> + Send {
        let log_file = self.log_file.clone();
        let resume_at = self.resume_at.lock().take();

        async move {
            let Some(path) = log_file else {
                return Err(CollectError::ConfigUnavailable(
                    "no daemon log file configured".into(),
                ));
            };

            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            let mut tail = match resume_at {
                Some(offset) => LogFileTail::new(&path, offset),
                None => LogFileTail::at_end(&path).await,
            };
            debug!(path = %path.display(), offset = tail.offset(), "following daemon log");

            tokio::spawn(async move {
                let _ = tx
                    .send(ControlEvent::StatusChanged(ChannelStatus::Connected))
                    .await;

                loop {
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = tokio::time::sleep(LOG_POLL_INTERVAL) => {
                            match tail.poll().await {
                                Ok(lines) => {
                                    for line in lines {
                                        if tx.send(ControlEvent::RawLine(line)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        path = %path.display(),
                                        error = %e,
                                        "daemon log unreadable"
                                    );
                                    let status = ChannelStatus::Disconnected;
                                    let _ = tx.send(ControlEvent::StatusChanged(status)).await;
                                    return;
                                }
                            }
                        }
                    }
                }
            });

            Ok(rx)
        }
    }

    fn request(&self, query: Query) -> impl Future<Output = Result<Reply, CollectError>> + Send {
        async move {
            match query {
                Query::Pid => self.find_pid().await.map(Reply::Pid),
                Query::Counter(name) => self.read_counter(&name).await.map(Reply::Counter),
                Query::ListenerPorts => Ok(Reply::ListenerPorts(self.ports)),
                Query::ConfigText => Err(CollectError::ConfigUnavailable(
                    "running configuration is not visible without a control connection".into(),
                )),
                Query::RelayDirectory => Err(CollectError::ConfigUnavailable(
                    "relay directory is not visible without a control connection".into(),
                )),
            }
        }
    }

    fn log_read_up_to(&self, path: &Path, offset: u64) {
        if self.log_file.as_deref() == Some(path) {
            *self.resume_at.lock() = Some(offset);
        }
    }
}

/// Extract a `field: value` line from /proc/<pid>/io.
fn parse_proc_io(content: &str, field: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == field {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
