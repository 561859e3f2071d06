use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use super::connection::{Protocol, RawConnection};
use super::strategy::{ResolveFuture, Strategy, StrategyKind};
use crate::error::{CollectError, ResolutionError};

/// TCP state code for ESTABLISHED in /proc/net/tcp.
const TCP_ESTABLISHED: &str = "01";

const TABLES: &[(&str, Protocol)] = &[
    ("tcp", Protocol::Tcp),
    ("tcp6", Protocol::Tcp),
    ("udp", Protocol::Udp),
    ("udp6", Protocol::Udp),
];

/// Resolves connections straight from kernel state: socket inodes held in
/// /proc/<pid>/fd are matched against the process's /proc/<pid>/net tables.
pub struct ProcStrategy {
    root: PathBuf,
}

impl ProcStrategy {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternative proc mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for ProcStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Proc
    }

    fn resolve<'a>(&'a self, pid: u32, _process_name: &'a str) -> ResolveFuture<'a> {
        let root = self.root.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || read_connections(&root, pid))
                .await
                .map_err(|e| CollectError::ToolUnavailable {
                    tool: "proc".into(),
                    detail: e.to_string(),
                })?
        })
    }
}

fn read_connections(root: &Path, pid: u32) -> Result<Vec<RawConnection>, ResolutionError> {
    let inodes = socket_inodes(root, pid)?;
    let mut conns = Vec::new();

    for (table, protocol) in TABLES {
        let path = root.join(pid.to_string()).join("net").join(table);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            // tcp6/udp6 are absent when IPv6 is disabled.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CollectError::from_io(&path.display().to_string(), &e)),
        };
        conns.extend(parse_proc_net(&content, *protocol, &inodes)?);
    }

    Ok(conns)
}

/// Inodes of the sockets held open by `pid`.
fn socket_inodes(root: &Path, pid: u32) -> Result<HashSet<u64>, ResolutionError> {
    let fd_dir = root.join(pid.to_string()).join("fd");
    let entries = std::fs::read_dir(&fd_dir)
        .map_err(|e| CollectError::from_io(&fd_dir.display().to_string(), &e))?;

    let mut inodes = HashSet::new();
    for entry in entries.flatten() {
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        if let Some(inode) = target
            .to_str()
            .and_then(|t| t.strip_prefix("socket:["))
            .and_then(|t| t.strip_suffix(']'))
            .and_then(|t| t.parse().ok())
        {
            inodes.insert(inode);
        }
    }

    Ok(inodes)
}

/// Parse a /proc/net/{tcp,tcp6,udp,udp6} table, keeping established TCP
/// and connected UDP sockets whose inode is in `inodes`.
pub fn parse_proc_net(
    content: &str,
    protocol: Protocol,
    inodes: &HashSet<u64>,
) -> Result<Vec<RawConnection>, ResolutionError> {
    let mut conns = Vec::new();

    for line in content.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 10 {
            continue;
        }

        let Ok(inode) = cols[9].parse::<u64>() else {
            continue;
        };
        if !inodes.contains(&inode) {
            continue;
        }

        if protocol == Protocol::Tcp && cols[3] != TCP_ESTABLISHED {
            continue;
        }

        let local = decode_endpoint(cols[1])
            .ok_or_else(|| CollectError::parse("proc", format!("bad local address: {line}")))?;
        let remote = decode_endpoint(cols[2])
            .ok_or_else(|| CollectError::parse("proc", format!("bad remote address: {line}")))?;

        if protocol == Protocol::Udp && remote.port() == 0 {
            continue;
        }

        conns.push(RawConnection::new(local, remote, protocol));
    }

    Ok(conns)
}

/// Decode a kernel `ADDR:PORT` pair, where the address is printed as
/// native-endian 32-bit words.
fn decode_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}
