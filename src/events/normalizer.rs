use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use super::entry::{LogEvent, Runlevel};

/// Reduces messages to their deduplication key.
///
/// Messages starting with one of the configured prefixes for their runlevel
/// share that prefix as key. A prefix beginning with `*` matches anywhere in
/// the message instead.
#[derive(Debug, Clone, Default)]
pub struct DedupRules {
    prefixes: HashMap<Runlevel, Vec<String>>,
}

impl DedupRules {
    pub fn new(prefixes: HashMap<Runlevel, Vec<String>>) -> Self {
        Self { prefixes }
    }

    /// Deduplication key for a message at the given runlevel.
    pub fn key<'a>(&'a self, runlevel: Runlevel, message: &'a str) -> &'a str {
        if let Some(common) = self.prefixes.get(&runlevel) {
            for prefix in common {
                let matched = match prefix.strip_prefix('*') {
                    Some(fragment) => message.contains(fragment),
                    None => message.starts_with(prefix.as_str()),
                };
                if matched {
                    return prefix;
                }
            }
        }
        message
    }

    /// Whether two messages of the same runlevel count as identical.
    pub fn same(&self, runlevel: Runlevel, a: &str, b: &str) -> bool {
        a == b || self.key(runlevel, a) == self.key(runlevel, b)
    }
}

/// One header line of the daemon log.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub timestamp: DateTime<Utc>,
    pub runlevel: Runlevel,
    pub message: String,
}

/// Parse a daemon log line of the form
/// `Jul 15 18:29:48.806 [notice] Parsing GEOIP file.`
///
/// The log omits the year, so the current year of `now` is assumed, rolling
/// back one year when that would place the entry in the future.
pub fn parse_daemon_line<Tz: TimeZone>(line: &str, now: &DateTime<Tz>) -> Option<ParsedLine> {
    let mut tokens = line.split_whitespace();
    let month = tokens.next()?;
    let day = tokens.next()?;
    let clock = tokens.next()?;
    let level = tokens.next()?;

    let runlevel = level
        .strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .and_then(Runlevel::parse)?;

    let (hms, fraction) = match clock.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (clock, None),
    };
    let time = NaiveTime::parse_from_str(hms, "%H:%M:%S").ok()?;
    let millis = match fraction {
        Some(frac) => parse_millis(frac)?,
        None => 0,
    };

    let zone = now.timezone();
    let mut resolved = None;
    for year in [now.year(), now.year() - 1] {
        let date = match NaiveDate::parse_from_str(&format!("{year} {month} {day}"), "%Y %b %d") {
            Ok(d) => d,
            Err(_) => continue,
        };
        let naive = NaiveDateTime::new(date, time) + chrono::Duration::milliseconds(millis);
        let local = match zone.from_local_datetime(&naive).earliest() {
            Some(t) => t,
            None => continue,
        };
        if local <= *now {
            resolved = Some(local.with_timezone(&Utc));
            break;
        }
    }

    let message = tokens.collect::<Vec<_>>().join(" ");

    Some(ParsedLine {
        timestamp: resolved?,
        runlevel,
        message,
    })
}

fn parse_millis(frac: &str) -> Option<i64> {
    if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits: String = frac.chars().chain("000".chars()).take(3).collect();
    digits.parse().ok()
}

#[derive(Debug)]
struct PendingRecord {
    runlevel: Runlevel,
    timestamp: DateTime<Utc>,
    message: String,
    continuation: bool,
}

impl PendingRecord {
    fn finish(self) -> LogEvent {
        LogEvent::daemon(self.runlevel, self.timestamp, self.message)
            .with_continuation(self.continuation)
    }
}

/// Assembles raw daemon lines into records.
///
/// A header line (one carrying a timestamp marker) opens a record. Following
/// lines without a marker are appended to it. A blank line, the next header,
/// or an explicit [`flush`](Self::flush) completes it.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Option<PendingRecord>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line. Returns a record when this line completes one.
    pub fn push<Tz: TimeZone>(&mut self, line: &str, now: &DateTime<Tz>) -> Option<LogEvent> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.trim().is_empty() {
            return self.flush();
        }

        if let Some(parsed) = parse_daemon_line(line, now) {
            let done = self.pending.take().map(PendingRecord::finish);
            self.pending = Some(PendingRecord {
                runlevel: parsed.runlevel,
                timestamp: parsed.timestamp,
                message: parsed.message,
                continuation: false,
            });
            return done;
        }

        match &mut self.pending {
            Some(record) => {
                record.message.push('\n');
                record.message.push_str(line.trim_end());
                record.continuation = true;
            }
            None => {
                // Orphaned continuation, keep it rather than losing it.
                self.pending = Some(PendingRecord {
                    runlevel: Runlevel::Notice,
                    timestamp: now.with_timezone(&Utc),
                    message: line.trim_end().to_string(),
                    continuation: true,
                });
            }
        }

        None
    }

    /// Complete the record in progress, if any.
    pub fn flush(&mut self) -> Option<LogEvent> {
        self.pending.take().map(PendingRecord::finish)
    }

    /// Whether a record is waiting for its terminator.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 20, 12, 0, 0).single().expect("valid date")
    }

    #[test]
    fn test_parse_daemon_line() {
        let parsed = parse_daemon_line("Jul 15 18:29:48.806 [notice] Parsing GEOIP file.", &now())
            .expect("parsable line");
        assert_eq!(parsed.runlevel, Runlevel::Notice);
        assert_eq!(parsed.message, "Parsing GEOIP file.");
        assert_eq!(
            parsed.timestamp,
            Utc.with_ymd_and_hms(2024, 7, 15, 18, 29, 48).single().expect("valid")
                + chrono::Duration::milliseconds(806)
        );
    }

    #[test]
    fn test_parse_daemon_line_rolls_back_year() {
        let parsed = parse_daemon_line("Dec 31 23:59:59.000 [warn] late entry", &now())
            .expect("parsable line");
        assert_eq!(parsed.timestamp.year(), 2023);
        assert_eq!(parsed.runlevel, Runlevel::Warn);
    }

    #[test]
    fn test_parse_daemon_line_rejects_garbage() {
        assert!(parse_daemon_line("not a log line at all", &now()).is_none());
        assert!(parse_daemon_line("Jul 15 18:29:48 [bogus] x", &now()).is_none());
        assert!(parse_daemon_line("Jul 15", &now()).is_none());
    }

    #[test]
    fn test_dedup_rules_prefix_and_substring() {
        let mut prefixes = HashMap::new();
        prefixes.insert(
            Runlevel::Notice,
            vec!["Bootstrapped".to_string(), "*circuit timeout".to_string()],
        );
        let rules = DedupRules::new(prefixes);

        assert!(rules.same(Runlevel::Notice, "Bootstrapped 10%", "Bootstrapped 90%"));
        assert!(rules.same(
            Runlevel::Notice,
            "learned a circuit timeout of 3s",
            "new circuit timeout of 5s"
        ));
        assert!(!rules.same(Runlevel::Warn, "Bootstrapped 10%", "Bootstrapped 90%"));
        assert_eq!(rules.key(Runlevel::Notice, "unrelated"), "unrelated");
    }

    #[test]
    fn test_assembler_multiline_record() {
        let mut asm = LineAssembler::new();
        let t = now();
        assert!(asm.push("Jul 15 18:29:48.806 [warn] Problem:", &t).is_none());
        assert!(asm.push("  first detail", &t).is_none());
        assert!(asm.push("  second detail", &t).is_none());

        let ev = asm
            .push("Jul 15 18:29:49.000 [notice] next", &t)
            .expect("header completes previous record");
        assert_eq!(ev.message, "Problem:\n  first detail\n  second detail");
        assert!(ev.continuation);
        assert_eq!(ev.runlevel, Runlevel::Warn);

        assert!(asm.is_pending());
        let last = asm.flush().expect("pending record");
        assert_eq!(last.message, "next");
        assert!(!last.continuation);
    }

    #[test]
    fn test_assembler_blank_line_terminates() {
        let mut asm = LineAssembler::new();
        let t = now();
        asm.push("Jul 15 18:29:48 [err] broken", &t);
        let ev = asm.push("", &t).expect("blank line flushes");
        assert_eq!(ev.runlevel, Runlevel::Err);
        assert!(!asm.is_pending());
        assert!(asm.push("", &t).is_none());
    }
}
