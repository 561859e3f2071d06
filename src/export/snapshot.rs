use std::path::Path;

use anyhow::{Context, Result};

use crate::snapshot::Snapshot;

/// Write `snapshot` as pretty JSON, replacing `path` atomically.
pub async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let data = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

    Ok(())
}
