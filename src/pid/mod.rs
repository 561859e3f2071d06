#[cfg(target_os = "linux")]
use anyhow::Context;
use anyhow::Result;
#[cfg(target_os = "linux")]
use tracing::debug;
use tracing::warn;

/// PID discovery trait.
pub trait Discovery: Send + Sync {
    /// Discover PIDs matching the configured criteria, lowest first.
    fn discover(&self) -> Result<Vec<u32>>;
}

/// Finds the monitored daemon by process name, unless a fixed PID is
/// configured.
pub struct NameDiscovery {
    process_name: String,
    fixed_pid: Option<u32>,
}

impl NameDiscovery {
    pub fn new(process_name: impl Into<String>, fixed_pid: Option<u32>) -> Self {
        Self {
            process_name: process_name.into(),
            fixed_pid,
        }
    }

    /// The first matching PID, if any.
    pub fn find(&self) -> Result<Option<u32>> {
        Ok(self.discover()?.into_iter().next())
    }
}

impl Discovery for NameDiscovery {
    #[cfg(target_os = "linux")]
    fn discover(&self) -> Result<Vec<u32>> {
        if let Some(pid) = self.fixed_pid {
            return Ok(vec![pid]);
        }

        let mut pids = discover_by_process_name(&self.process_name)?;
        pids.sort_unstable();

        if pids.is_empty() {
            warn!(name = %self.process_name, "no matching process found");
        } else {
            debug!(name = %self.process_name, count = pids.len(), "discovered PIDs");
        }

        Ok(pids)
    }

    #[cfg(not(target_os = "linux"))]
    fn discover(&self) -> Result<Vec<u32>> {
        if let Some(pid) = self.fixed_pid {
            return Ok(vec![pid]);
        }
        warn!("process discovery by name is only supported on Linux");
        Ok(Vec::new())
    }
}

/// Scan /proc for processes matching the given name.
#[cfg(target_os = "linux")]
fn discover_by_process_name(name: &str) -> Result<Vec<u32>> {
    use std::fs;

    let entries = fs::read_dir("/proc").context("reading /proc")?;

    let mut pids = Vec::with_capacity(4);

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let pid: u32 = match entry.file_name().to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        let comm = match read_proc_comm(pid) {
            Ok(c) => c,
            Err(_) => continue,
        };

        let matched = comm == name
            || read_proc_cmdline(pid)
                .map(|cmdline| cmdline_matches(&cmdline, name))
                .unwrap_or(false);

        if matched {
            debug!(pid, comm = %comm, "found matching process");
            pids.push(pid);
        }
    }

    Ok(pids)
}

/// Whether the executable named by a command line is `name`.
fn cmdline_matches(cmdline: &str, name: &str) -> bool {
    cmdline
        .split_whitespace()
        .next()
        .and_then(|argv0| argv0.rsplit('/').next())
        .is_some_and(|exe| exe == name)
}

/// Read /proc/<pid>/comm, returning the trimmed process name.
#[cfg(target_os = "linux")]
pub fn read_proc_comm(pid: u32) -> Result<String> {
    let path = format!("/proc/{pid}/comm");
    let data = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    Ok(data.trim().to_string())
}

/// Read /proc/<pid>/cmdline, joining null-separated args with spaces.
#[cfg(target_os = "linux")]
fn read_proc_cmdline(pid: u32) -> Result<String> {
    let path = format!("/proc/{pid}/cmdline");
    let data = std::fs::read(&path).with_context(|| format!("reading {path}"))?;
    Ok(String::from_utf8_lossy(&data).replace('\0', " "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_matches_executable_name() {
        assert!(cmdline_matches("/usr/bin/tor -f /etc/tor/torrc", "tor"));
        assert!(cmdline_matches("tor", "tor"));
        assert!(!cmdline_matches("/usr/bin/torsocks curl", "tor"));
        assert!(!cmdline_matches("/usr/bin/python3 tor", "tor"));
        assert!(!cmdline_matches("", "tor"));
    }

    #[test]
    fn test_fixed_pid_skips_scan() {
        let disc = NameDiscovery::new("tor", Some(4242));
        assert_eq!(disc.discover().expect("discover"), vec![4242]);
        assert_eq!(disc.find().expect("find"), Some(4242));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_discovers_own_process() {
        let own = std::process::id();
        let comm = read_proc_comm(own).expect("own comm");
        let disc = NameDiscovery::new(comm, None);
        assert!(disc.discover().expect("discover").contains(&own));
    }
}
