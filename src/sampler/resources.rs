use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::CollectError;
use crate::events::entry::Diagnostic;
use crate::resolver::command::run_command;

/// Consecutive failures tolerated per facility.
const MAX_FAILURES: u32 = 3;

/// Kernel clock ticks per second assumed for /proc/<pid>/stat.
const CLOCK_TICKS: f64 = 100.0;

/// Process cpu and memory usage at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    /// Cpu usage since the previous sample, in percent of one core.
    pub cpu_sample: f64,
    /// Cpu usage averaged over the process lifetime, in percent.
    pub cpu_average: f64,
    pub memory_bytes: u64,
    pub memory_percent: f64,
}

/// Raw readings before cpu deltas are applied.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    cpu_secs: f64,
    elapsed_secs: f64,
    memory_bytes: u64,
    memory_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Facility {
    Proc,
    Ps,
    Disabled,
}

/// Tracks resource usage of the monitored process, preferring /proc and
/// falling back to `ps`.
pub struct ResourceTracker {
    proc_root: PathBuf,
    timeout: Duration,
    facility: Facility,
    failures: u32,
    previous: Option<(Instant, f64)>,
    pending: Option<Diagnostic>,
}

impl ResourceTracker {
    pub fn new(timeout: Duration) -> Self {
        let facility = if cfg!(target_os = "linux") {
            Facility::Proc
        } else {
            Facility::Ps
        };
        Self {
            proc_root: PathBuf::from("/proc"),
            timeout,
            facility,
            failures: 0,
            previous: None,
            pending: None,
        }
    }

    /// Read from an alternative proc mount.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self.facility = Facility::Proc;
        self
    }

    /// Whether every facility has been given up on.
    pub fn is_disabled(&self) -> bool {
        self.facility == Facility::Disabled
    }

    /// Diagnostic raised by the last sample, if any.
    pub fn take_diagnostic(&mut self) -> Option<Diagnostic> {
        self.pending.take()
    }

    /// Forget the cpu baseline, e.g. after the process restarted.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub async fn sample(&mut self, pid: u32) -> Result<ResourceSample, CollectError> {
        let result = match self.facility {
            Facility::Proc => self.read_proc(pid).await,
            Facility::Ps => self.read_ps(pid).await,
            Facility::Disabled => {
                return Err(CollectError::ToolUnavailable {
                    tool: "resource usage".into(),
                    detail: "all facilities failed".into(),
                })
            }
        };

        match result {
            Ok(reading) => {
                self.failures = 0;
                Ok(self.apply(reading))
            }
            Err(e) => {
                self.failures += 1;
                if self.failures >= MAX_FAILURES {
                    self.failures = 0;
                    self.previous = None;
                    match self.facility {
                        Facility::Proc => {
                            info!(error = %e, "proc resource lookups failing, falling back to ps");
                            self.facility = Facility::Ps;
                        }
                        _ => {
                            warn!(error = %e, "unable to query process resource usage");
                            self.facility = Facility::Disabled;
                            self.pending = Some(Diagnostic::warn(
                                "Failed three attempts to get process resource usage",
                            ));
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn apply(&mut self, reading: Reading) -> ResourceSample {
        let now = Instant::now();
        let cpu_average = if reading.elapsed_secs > 0.0 {
            reading.cpu_secs / reading.elapsed_secs * 100.0
        } else {
            0.0
        };

        let cpu_sample = match self.previous {
            Some((at, cpu)) if now > at && reading.cpu_secs >= cpu => {
                (reading.cpu_secs - cpu) / now.duration_since(at).as_secs_f64() * 100.0
            }
            _ => cpu_average,
        };
        self.previous = Some((now, reading.cpu_secs));

        ResourceSample {
            cpu_sample,
            cpu_average,
            memory_bytes: reading.memory_bytes,
            memory_percent: reading.memory_percent,
        }
    }

    async fn read_proc(&self, pid: u32) -> Result<Reading, CollectError> {
        let stat_path = self.proc_root.join(pid.to_string()).join("stat");
        let status_path = self.proc_root.join(pid.to_string()).join("status");
        let uptime_path = self.proc_root.join("uptime");
        let meminfo_path = self.proc_root.join("meminfo");

        let stat = read(&stat_path).await?;
        let status = read(&status_path).await?;
        let uptime = read(&uptime_path).await?;
        let meminfo = read(&meminfo_path).await?;

        let (cpu_ticks, start_ticks) = parse_proc_stat(&stat)
            .ok_or_else(|| CollectError::parse("proc stat", stat.trim().to_string()))?;
        let uptime: f64 = uptime
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CollectError::parse("proc uptime", uptime.trim().to_string()))?;
        let rss = parse_status_kb(&status, "VmRSS")
            .ok_or_else(|| CollectError::parse("proc status", "missing VmRSS"))?;
        let total = parse_status_kb(&meminfo, "MemTotal")
            .ok_or_else(|| CollectError::parse("proc meminfo", "missing MemTotal"))?;

        let memory_bytes = rss * 1024;
        Ok(Reading {
            cpu_secs: cpu_ticks as f64 / CLOCK_TICKS,
            elapsed_secs: (uptime - start_ticks as f64 / CLOCK_TICKS).max(0.0),
            memory_bytes,
            memory_percent: if total > 0 {
                rss as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        })
    }

    async fn read_ps(&self, pid: u32) -> Result<Reading, CollectError> {
        let args = [
            "-p".to_string(),
            pid.to_string(),
            "-o".to_string(),
            "cputime=,etime=,rss=,%mem=".to_string(),
        ];
        let output = run_command("ps", &args, self.timeout).await?;
        parse_ps_line(&output).ok_or_else(|| CollectError::parse("ps", output.trim().to_string()))
    }
}

async fn read(path: &std::path::Path) -> Result<String, CollectError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CollectError::from_io(&path.display().to_string(), &e))
}

/// Cpu ticks (user + system) and start time in ticks from /proc/<pid>/stat.
fn parse_proc_stat(content: &str) -> Option<(u64, u64)> {
    // The command name may contain spaces; fields resume after its ')'.
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let start: u64 = fields.get(19)?.parse().ok()?;
    Some((utime + stime, start))
}

/// A `Key:   1234 kB` value from /proc/<pid>/status or /proc/meminfo.
fn parse_status_kb(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        v.split_whitespace().next()?.parse().ok()
    })
}

/// Parse `ps -o cputime=,etime=,rss=,%mem=` output.
fn parse_ps_line(output: &str) -> Option<Reading> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return None;
    }

    let rss_kb: u64 = fields[2].parse().ok()?;
    Some(Reading {
        cpu_secs: parse_ps_time(fields[0])?,
        elapsed_secs: parse_ps_time(fields[1])?,
        memory_bytes: rss_kb * 1024,
        memory_percent: fields[3].parse().ok()?,
    })
}

/// Parse `[[dd-]hh:]mm:ss[.ff]` into seconds.
pub fn parse_ps_time(value: &str) -> Option<f64> {
    let (days, clock) = match value.split_once('-') {
        Some((d, rest)) => (d.parse::<f64>().ok()?, rest),
        None => (0.0, value),
    };

    let mut secs = 0.0;
    for part in clock.split(':') {
        secs = secs * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(days * 86_400.0 + secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (tor daemon) S 1 1234 1234 0 -1 4194560 5000 0 0 0 250 150 0 0 20 0 1 0 1000 123456789 4321 18446744073709551615";

    #[test]
    fn test_parse_proc_stat() {
        assert_eq!(parse_proc_stat(STAT), Some((400, 1000)));
        assert_eq!(parse_proc_stat("garbage"), None);
    }

    #[test]
    fn test_parse_status_kb() {
        let status = "Name:\ttor\nVmRSS:\t   20480 kB\nThreads:\t4\n";
        assert_eq!(parse_status_kb(status, "VmRSS"), Some(20480));
        assert_eq!(parse_status_kb(status, "VmSwap"), None);
    }

    #[test]
    fn test_parse_ps_time() {
        assert_eq!(parse_ps_time("00:05"), Some(5.0));
        assert_eq!(parse_ps_time("01:02:03"), Some(3723.0));
        assert_eq!(parse_ps_time("2-00:00:01"), Some(172_801.0));
        assert_eq!(parse_ps_time("abc"), None);
    }

    #[test]
    fn test_parse_ps_line() {
        let reading = parse_ps_line("  01:00  1-00:00:00  2048  1.5\n").expect("parse");
        assert_eq!(reading.cpu_secs, 60.0);
        assert_eq!(reading.elapsed_secs, 86_400.0);
        assert_eq!(reading.memory_bytes, 2048 * 1024);
        assert_eq!(reading.memory_percent, 1.5);
    }

    #[tokio::test]
    async fn test_proc_reading_from_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        let pid_dir = dir.path().join("1234");
        std::fs::create_dir_all(&pid_dir).expect("mkdir");
        std::fs::write(pid_dir.join("stat"), STAT).expect("stat");
        std::fs::write(pid_dir.join("status"), "VmRSS:\t1024 kB\n").expect("status");
        std::fs::write(dir.path().join("uptime"), "30.00 100.00\n").expect("uptime");
        std::fs::write(dir.path().join("meminfo"), "MemTotal: 4096 kB\n").expect("meminfo");

        let mut tracker = ResourceTracker::new(Duration::from_secs(1)).with_proc_root(dir.path());
        let sample = tracker.sample(1234).await.expect("sample");
        // 4s of cpu over 20s of life.
        assert!((sample.cpu_average - 20.0).abs() < 1e-9);
        assert_eq!(sample.memory_bytes, 1024 * 1024);
        assert!((sample.memory_percent - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_failures() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut tracker = ResourceTracker::new(Duration::from_secs(1)).with_proc_root(dir.path());

        for _ in 0..MAX_FAILURES {
            assert!(tracker.sample(999_999).await.is_err());
        }
        assert_eq!(tracker.facility, Facility::Ps);

        // ps has no such process either.
        for _ in 0..MAX_FAILURES {
            assert!(tracker.sample(999_999_999).await.is_err());
        }
        assert!(tracker.is_disabled());
        assert!(tracker.take_diagnostic().is_some());
    }
}
