use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

use super::series::BackfillPoint;
use crate::error::CollectError;

/// Native interval of the daemon's bandwidth history, in seconds.
const DEFAULT_HISTORY_INTERVAL: u64 = 900;

const ENDS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Bandwidth history recorded by the daemon in its state file, in bytes
/// per second.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthHistory {
    pub read: Vec<BackfillPoint>,
    pub written: Vec<BackfillPoint>,
}

#[derive(Default)]
struct Direction {
    values: Option<Vec<u64>>,
    ends: Option<DateTime<Utc>>,
    interval: Option<u64>,
}

impl Direction {
    fn into_points(self, label: &str) -> Result<Vec<BackfillPoint>, CollectError> {
        let (Some(mut values), Some(ends)) = (self.values, self.ends) else {
            return Err(CollectError::parse(
                "state file",
                format!("bandwidth {label} history missing"),
            ));
        };
        let interval = self.interval.unwrap_or(DEFAULT_HISTORY_INTERVAL).max(1);

        // The newest value is a running counter for the unfinished period.
        values.pop();

        // Ends marks the start of the following period, so the last complete
        // value ended one interval earlier.
        let step = TimeDelta::seconds(interval as i64);
        let last = ends - step;
        let count = values.len() as i32;

        Ok(values
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| BackfillPoint {
                at: last - step * (count - 1 - i as i32),
                value: bytes as f64 / interval as f64,
                span: Duration::from_secs(interval),
            })
            .collect())
    }
}

/// Parse the `BWHistory*` entries of a daemon state file.
pub fn parse_state_file(content: &str) -> Result<BandwidthHistory, CollectError> {
    let mut read = Direction::default();
    let mut written = Direction::default();

    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once(' ') else {
            continue;
        };
        let value = value.trim();

        let (dir, field) = match key {
            "BWHistoryReadValues" => (&mut read, "Values"),
            "BWHistoryWriteValues" => (&mut written, "Values"),
            "BWHistoryReadEnds" => (&mut read, "Ends"),
            "BWHistoryWriteEnds" => (&mut written, "Ends"),
            "BWHistoryReadInterval" => (&mut read, "Interval"),
            "BWHistoryWriteInterval" => (&mut written, "Interval"),
            _ => continue,
        };

        match field {
            "Values" => {
                let values = value
                    .split(',')
                    .filter(|v| !v.is_empty())
                    .map(|v| v.trim().parse::<u64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| CollectError::parse("state file", format!("{key}: {e}")))?;
                dir.values = Some(values);
            }
            "Ends" => {
                let ends = NaiveDateTime::parse_from_str(value, ENDS_FORMAT)
                    .map_err(|e| CollectError::parse("state file", format!("{key}: {e}")))?;
                dir.ends = Some(ends.and_utc());
            }
            _ => {
                dir.interval = value.parse().ok();
            }
        }
    }

    Ok(BandwidthHistory {
        read: read.into_points("read")?,
        written: written.into_points("write")?,
    })
}

/// Read and parse a daemon state file.
pub async fn read_state_file(path: &Path) -> Result<BandwidthHistory, CollectError> {
    let tool = path.display().to_string();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CollectError::from_io(&tool, &e))?;
    parse_state_file(&content)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const STATE: &str = "\
# Tor state file last generated on 2024-07-20 12:00:00 local time
Guard in=default rsa_id=AAAA
BWHistoryReadEnds 2024-07-20 12:00:00
BWHistoryReadInterval 900
BWHistoryReadValues 900000,1800000,450
BWHistoryWriteEnds 2024-07-20 12:00:00
BWHistoryWriteInterval 900
BWHistoryWriteValues 9000,18000,7
";

    #[test]
    fn test_parse_state_file() {
        let history = parse_state_file(STATE).expect("parse");
        assert_eq!(history.read.len(), 2);

        let ends = Utc
            .with_ymd_and_hms(2024, 7, 20, 12, 0, 0)
            .single()
            .expect("valid time");
        assert_eq!(history.read[1].at, ends - TimeDelta::seconds(900));
        assert_eq!(history.read[0].at, ends - TimeDelta::seconds(1800));
        assert_eq!(history.read[0].value, 1000.0);
        assert_eq!(history.read[1].value, 2000.0);
        assert_eq!(history.written[1].value, 20.0);
        assert_eq!(history.read[0].span, Duration::from_secs(900));
    }

    #[test]
    fn test_missing_entries() {
        let err = parse_state_file("BWHistoryReadValues 1,2\n").expect_err("incomplete");
        assert_eq!(err.kind(), "parse_error");
    }

    #[test]
    fn test_garbled_values() {
        let bad = STATE.replace("900000,1800000,450", "900000,abc");
        assert!(parse_state_file(&bad).is_err());
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let err = read_state_file(Path::new("/nonexistent/relaymon/state"))
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), "tool_unavailable");
    }
}
