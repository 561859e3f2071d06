use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::connection::{Protocol, RawConnection};
use super::strategy::{ResolveFuture, Strategy, StrategyKind};
use crate::error::{CollectError, ResolutionError};

/// Resolves connections by running a system utility and parsing its output.
pub struct CommandStrategy {
    kind: StrategyKind,
    timeout: Duration,
}

impl CommandStrategy {
    pub fn new(kind: StrategyKind, timeout: Duration) -> Self {
        Self { kind, timeout }
    }
}

impl Strategy for CommandStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn resolve<'a>(&'a self, pid: u32, process_name: &'a str) -> ResolveFuture<'a> {
        Box::pin(async move {
            let (program, args) = command_line(self.kind, pid).ok_or_else(|| {
                CollectError::ToolUnavailable {
                    tool: self.kind.to_string(),
                    detail: "not a command strategy".into(),
                }
            })?;
            let output = run_command(program, &args, self.timeout).await?;
            parse_output(self.kind, &output, pid, process_name)
        })
    }
}

/// Program and arguments for a command strategy.
fn command_line(kind: StrategyKind, pid: u32) -> Option<(&'static str, Vec<String>)> {
    let (program, args): (&str, &[&str]) = match kind {
        StrategyKind::Proc => return None,
        // n = no dns lookups, p = include process
        StrategyKind::Netstat => ("netstat", &["-np"]),
        // n = numeric ports, p = include process, t = tcp, u = udp
        StrategyKind::Ss => ("ss", &["-nptu"]),
        // w = no warnings, n = no dns, P = numeric ports, i = ip only
        StrategyKind::Lsof => ("lsof", &["-wnPi"]),
        StrategyKind::Sockstat => ("sockstat", &[]),
        StrategyKind::BsdSockstat => ("sockstat", &["-4c"]),
        StrategyKind::BsdProcstat => return Some(("procstat", vec!["-f".into(), pid.to_string()])),
    };
    Some((program, args.iter().map(|a| (*a).to_string()).collect()))
}

/// Run a utility to completion within `timeout`, returning its stdout.
///
/// The child is killed if the call times out or the future is dropped.
pub async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String, CollectError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CollectError::from_io(program, &e))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| CollectError::timeout(program, timeout))?
        .map_err(|e| CollectError::from_io(program, &e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lower = stderr.to_lowercase();
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return Err(CollectError::PermissionDenied(format!(
                "{program}: {}",
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(CollectError::ToolUnavailable {
                tool: program.to_string(),
                detail: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        debug!(program, status = %output.status, "non-zero exit with output, parsing anyway");
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse a utility's output into the connections of `pid`.
///
/// Output with no lines at all is an error; lines of which none belong to
/// the process yield an empty listing.
pub fn parse_output(
    kind: StrategyKind,
    output: &str,
    pid: u32,
    process_name: &str,
) -> Result<Vec<RawConnection>, ResolutionError> {
    if output.trim().is_empty() {
        return Err(CollectError::parse(kind.to_string(), "no results"));
    }

    let pid_str = pid.to_string();
    let mut conns = Vec::new();

    for line in output.lines() {
        let Some(fields) = select_fields(kind, line, &pid_str, process_name) else {
            continue;
        };

        let Some(protocol) = Protocol::from_label(fields.protocol) else {
            return Err(CollectError::parse(kind.to_string(), format!("bad protocol: {line}")));
        };
        let local = parse_endpoint(fields.local);
        let remote = parse_endpoint(fields.remote);

        match (local, remote) {
            (Some(local), Some(remote)) => conns.push(RawConnection::new(local, remote, protocol)),
            // Unconnected or wildcard peers.
            _ if is_wildcard(fields.remote) || is_wildcard(fields.local) => {}
            _ => {
                return Err(CollectError::parse(
                    kind.to_string(),
                    format!("bad address: {line}"),
                ))
            }
        }
    }

    Ok(conns)
}

struct Fields<'a> {
    protocol: &'a str,
    local: &'a str,
    remote: &'a str,
}

/// Pick the protocol, local and remote columns of a line belonging to the
/// process, or `None` for lines of other processes and headers.
fn select_fields<'a>(
    kind: StrategyKind,
    line: &'a str,
    pid: &str,
    name: &str,
) -> Option<Fields<'a>> {
    let cols: Vec<&str> = line.split_whitespace().collect();

    match kind {
        StrategyKind::Proc => None,
        // tcp  0  0  127.0.0.1:9051  127.0.0.1:53308  ESTABLISHED 9912/tor
        StrategyKind::Netstat => {
            let owner = format!("{pid}/{name}");
            let state_idx = cols.iter().position(|c| *c == "ESTABLISHED")?;
            if cols.get(state_idx + 1) != Some(&owner.as_str()) {
                return None;
            }
            Some(Fields {
                protocol: cols.first()?,
                local: cols.get(3)?,
                remote: cols.get(4)?,
            })
        }
        // tcp  ESTAB  0  0  127.0.0.1:9051  127.0.0.1:53308  users:(("tor",pid=9912,fd=20))
        StrategyKind::Ss => {
            if cols.get(1) != Some(&"ESTAB") {
                return None;
            }
            let users = cols.get(6)?;
            let modern = format!("\"{name}\",pid={pid},");
            let legacy = format!("\"{name}\",{pid},");
            if !users.contains(&modern) && !users.contains(&legacy) {
                return None;
            }
            Some(Fields {
                protocol: cols.first()?,
                local: cols.get(4)?,
                remote: cols.get(5)?,
            })
        }
        // tor  3873  atagar  45u  IPv4  40994  0t0  TCP 10.243.55.20:45724->194.154.227.109:9001 (ESTABLISHED)
        StrategyKind::Lsof => {
            if cols.first() != Some(&name) || cols.get(1) != Some(&pid) {
                return None;
            }
            let established = cols.last() == Some(&"(ESTABLISHED)");
            let cols: Vec<&str> = cols.into_iter().filter(|c| *c != "(ESTABLISHED)").collect();
            let protocol = *cols.get(cols.len().checked_sub(2)?)?;
            if !established && !protocol.eq_ignore_ascii_case("udp") {
                return None;
            }
            let (local, remote) = cols.last()?.split_once("->")?;
            Some(Fields {
                protocol,
                local,
                remote,
            })
        }
        // atagar  tor  3475  tcp4  127.0.0.1:9051  127.0.0.1:38942  ESTABLISHED
        StrategyKind::Sockstat => {
            if cols.get(1) != Some(&name)
                || cols.get(2) != Some(&pid)
                || !cols.contains(&"ESTABLISHED")
            {
                return None;
            }
            Some(Fields {
                protocol: cols.get(3)?,
                local: cols.get(4)?,
                remote: cols.get(5)?,
            })
        }
        // atagar  tor  3475  7  tcp4  127.0.0.1:9051  127.0.0.1:38942
        StrategyKind::BsdSockstat => {
            if cols.get(1) != Some(&name) || cols.get(2) != Some(&pid) {
                return None;
            }
            Some(Fields {
                protocol: cols.get(4)?,
                local: cols.get(5)?,
                remote: cols.get(6)?,
            })
        }
        // 3561  tor  4  s  -  rw---n--  2  0  TCP  10.0.0.2:9050  10.0.0.1:22370
        StrategyKind::BsdProcstat => {
            if cols.first() != Some(&pid)
                || cols.get(8) != Some(&"TCP")
                || line.contains("0.0.0.0:0")
            {
                return None;
            }
            Some(Fields {
                protocol: cols.get(8)?,
                local: cols.get(9)?,
                remote: cols.get(10)?,
            })
        }
    }
}

/// Parse `1.2.3.4:80`, `[::1]:80` or the unbracketed `::1:80` form.
pub fn parse_endpoint(field: &str) -> Option<SocketAddr> {
    if field.starts_with('[') {
        return field.parse().ok();
    }
    let (ip, port) = field.rsplit_once(':')?;
    let ip: IpAddr = ip.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

fn is_wildcard(field: &str) -> bool {
    field.contains('*')
}

/// A process on the other end of a local connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub command: String,
    pub pid: u32,
}

/// Name the processes holding the given local TCP ports, via `lsof`.
pub async fn process_for_ports(
    ports: &[u16],
    timeout: Duration,
) -> Result<HashMap<u16, Vec<PortOwner>>, CollectError> {
    if ports.is_empty() {
        return Ok(HashMap::new());
    }

    let mut args = vec!["-nP".to_string()];
    for port in ports {
        args.push("-i".to_string());
        args.push(format!("tcp:{port}"));
    }

    let output = run_command("lsof", &args, timeout).await?;
    if output.trim().is_empty() {
        return Err(CollectError::parse("lsof", "no results"));
    }

    Ok(parse_port_owners(&output, ports))
}

/// Parse `lsof -nP -i tcp:<port>` output into owners per queried port.
pub fn parse_port_owners(output: &str, ports: &[u16]) -> HashMap<u16, Vec<PortOwner>> {
    let mut owners: HashMap<u16, Vec<PortOwner>> = HashMap::new();

    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() != 10 || cols[9] != "(ESTABLISHED)" {
            continue;
        }
        let Ok(pid) = cols[1].parse::<u32>() else {
            continue;
        };
        let Some((a, b)) = cols[8].split_once("->") else {
            continue;
        };

        for side in [a, b] {
            let Some(port) = side.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()) else {
                continue;
            };
            if !ports.contains(&port) {
                continue;
            }
            let owner = PortOwner {
                command: cols[0].to_string(),
                pid,
            };
            let list = owners.entry(port).or_default();
            if !list.contains(&owner) {
                list.push(owner);
            }
        }
    }

    owners
}
