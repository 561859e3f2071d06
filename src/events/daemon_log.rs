use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::entry::LogEvent;
use super::normalizer::LineAssembler;
use crate::error::CollectError;

/// Messages marking the start of a daemon instance's log.
const SESSION_MARKERS: &[&str] = &["opening log file", "opening new log file"];

/// Parse the contents of a daemon log, keeping only the newest `limit`
/// records of the current daemon session.
pub fn parse_log_contents<Tz: TimeZone>(
    content: &str,
    limit: usize,
    now: &DateTime<Tz>,
) -> Vec<LogEvent> {
    let mut asm = LineAssembler::new();
    let mut records = Vec::new();

    for line in content.lines() {
        if let Some(record) = asm.push(line, now) {
            records.push(record);
        }
    }
    if let Some(record) = asm.flush() {
        records.push(record);
    }

    let session_start = records
        .iter()
        .rposition(|r| SESSION_MARKERS.iter().any(|m| r.message.contains(m)))
        .unwrap_or(0);

    let session = &records[session_start..];
    let skip = session.len().saturating_sub(limit);
    session[skip..].to_vec()
}

/// Read a daemon log file for prepopulation. Returns the parsed records and
/// the file length, from which a [`LogFileTail`] can continue.
pub async fn read_log_file<Tz: TimeZone>(
    path: &Path,
    limit: usize,
    now: &DateTime<Tz>,
) -> Result<(Vec<LogEvent>, u64)> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading daemon log {}", path.display()))?;
    let content = String::from_utf8_lossy(&data);
    let records = parse_log_contents(&content, limit, now);

    debug!(
        path = %path.display(),
        records = records.len(),
        "read daemon log file",
    );

    Ok((records, data.len() as u64))
}

/// Follows a growing log file, yielding complete lines.
#[derive(Debug)]
pub struct LogFileTail {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl LogFileTail {
    /// Follow `path` starting at byte `offset`.
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            partial: String::new(),
        }
    }

    /// Follow `path` from its current end.
    pub async fn at_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Self::new(path, offset)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read lines appended since the last poll. A truncated file is read
    /// again from the start; a missing file yields nothing.
    pub async fn poll(&mut self) -> Result<Vec<String>, CollectError> {
        let tool = self.path.display().to_string();

        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CollectError::from_io(&tool, &e)),
        };

        if len < self.offset {
            debug!(path = %tool, "log file truncated, reading from start");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| CollectError::from_io(&tool, &e))?;
        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| CollectError::from_io(&tool, &e))?;

        let mut buf = Vec::with_capacity(usize::try_from(len - self.offset).unwrap_or(0));
        let read = file
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CollectError::from_io(&tool, &e))?;
        self.offset += read as u64;

        self.partial.push_str(&String::from_utf8_lossy(&buf));

        let mut lines = Vec::new();
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }

        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::events::entry::Runlevel;

    const LOG: &str = "\
Jul 15 10:00:00.000 [notice] Tor 0.4.8 opening log file.
Jul 15 10:00:01.000 [notice] old session
Jul 15 11:00:00.000 [notice] Tor 0.4.8 opening new log file.
Jul 15 11:00:01.000 [notice] Bootstrapped 5%
Jul 15 11:00:02.000 [warn] Problem:
  with detail
Jul 15 11:00:03.000 [notice] Bootstrapped 100%
";

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 20, 0, 0, 0).single().expect("valid date")
    }

    #[test]
    fn test_parse_stops_at_session_marker() {
        let records = parse_log_contents(LOG, 100, &now());
        assert_eq!(records.len(), 4);
        assert!(records[0].message.contains("opening new log file"));
        assert_eq!(records[2].runlevel, Runlevel::Warn);
        assert_eq!(records[2].message, "Problem:\n  with detail");
    }

    #[test]
    fn test_parse_respects_limit() {
        let records = parse_log_contents(LOG, 2, &now());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].message, "Bootstrapped 100%");
    }

    #[tokio::test]
    async fn test_tail_follows_appends_and_truncation() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "existing line").expect("write");

        let mut tail = LogFileTail::at_end(file.path()).await;
        assert!(tail.poll().await.expect("poll").is_empty());

        write!(file, "first\nsecond\npart").expect("write");
        file.flush().expect("flush");
        let lines = tail.poll().await.expect("poll");
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);

        writeln!(file, "ial").expect("write");
        file.flush().expect("flush");
        assert_eq!(tail.poll().await.expect("poll"), vec!["partial".to_string()]);

        file.as_file().set_len(0).expect("truncate");
        std::fs::write(file.path(), "fresh\n").expect("rewrite");
        assert_eq!(tail.poll().await.expect("poll"), vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_read_log_file_returns_length() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(LOG.as_bytes()).expect("write");
        let (records, len) = read_log_file(file.path(), 10, &now()).await.expect("read");
        assert_eq!(records.len(), 4);
        assert_eq!(len, LOG.len() as u64);
    }
}
