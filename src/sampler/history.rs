use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::series::{BackfillPoint, Series};

/// Version written into, and required from, history documents.
pub const HISTORY_VERSION: u32 = 1;

/// Numeric history persisted between sessions.
///
/// Stored as `{"version": 1, "metrics": {"name": [[ts_secs, value], ...]}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub version: u32,
    pub metrics: BTreeMap<String, Vec<(i64, f64)>>,
}

impl History {
    /// Capture the populated buckets of every series.
    pub fn from_series<'a>(series: impl IntoIterator<Item = (&'a String, &'a Series)>) -> Self {
        let metrics = series
            .into_iter()
            .map(|(name, s)| {
                let points = s
                    .values()
                    .into_iter()
                    .map(|(at, value)| (at.timestamp(), value))
                    .collect();
                (name.clone(), points)
            })
            .collect();

        Self {
            version: HISTORY_VERSION,
            metrics,
        }
    }

    /// Backfill points for a metric, each covering one `tick`.
    pub fn points(&self, name: &str, tick: Duration) -> Vec<BackfillPoint> {
        self.metrics
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|&(secs, value)| {
                let at: DateTime<Utc> = Utc.timestamp_opt(secs, 0).single()?;
                Some(BackfillPoint {
                    at,
                    value,
                    span: tick,
                })
            })
            .collect()
    }

    /// Read a history document. A missing file is not an error.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let data = match tokio::fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading history {}", path.display()))
            }
        };

        let history: History = serde_json::from_slice(&data)
            .with_context(|| format!("parsing history {}", path.display()))?;
        if history.version != HISTORY_VERSION {
            bail!(
                "unsupported history version {} in {}",
                history.version,
                path.display()
            );
        }

        Ok(Some(history))
    }

    /// Write the document atomically next to `path`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(self).context("serializing history")?;
        let tmp = path.with_extension("tmp");

        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

        debug!(path = %path.display(), metrics = self.metrics.len(), "history saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.json");

        let mut series = Series::new(Duration::from_secs(1), 10);
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().expect("time");
        series.record_live(t0, 12.5);
        series.record_live(t0 + chrono::TimeDelta::seconds(2), 3.0);
        let name = "bandwidth.read".to_string();

        let history = History::from_series([(&name, &series)]);
        history.save(&path).await.expect("save");

        let loaded = History::load(&path).await.expect("load").expect("present");
        assert_eq!(loaded, history);
        assert_eq!(
            loaded.metrics.get("bandwidth.read"),
            Some(&vec![(1_700_000_000, 12.5), (1_700_000_002, 3.0)])
        );

        let points = loaded.points("bandwidth.read", Duration::from_secs(1));
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].at, t0);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let loaded = History::load(&dir.path().join("absent.json"))
            .await
            .expect("missing is fine");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.json");
        tokio::fs::write(&path, br#"{"version": 7, "metrics": {}}"#)
            .await
            .expect("write");
        assert!(History::load(&path).await.is_err());
    }
}
