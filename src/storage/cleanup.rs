use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::observability::metrics as obs;

// ---------------------------------------------------------------------------
// Staging sweeper
// ---------------------------------------------------------------------------

/// Background task removing work-dir entries left behind by crashed or killed
/// packaging jobs. Live jobs never get this old: the maximum age is validated
/// to exceed the per-rendition encode timeout.
pub async fn run_staging_sweeper(
    work_dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        work_dir = %work_dir.display(),
        "staging sweeper started (interval: {}s, max age: {}s)",
        interval.as_secs(),
        max_age.as_secs()
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("staging sweeper shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                match sweep_once(&work_dir, max_age, SystemTime::now()).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "removed stale staging entries"),
                    Err(e) => error!(error = %e, "staging sweep failed"),
                }
            }
        }
    }
}

/// Remove every direct child of `work_dir` last modified more than `max_age`
/// before `now`. Returns the number of entries removed.
pub async fn sweep_once(work_dir: &Path, max_age: Duration, now: SystemTime) -> std::io::Result<u64> {
    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0u64;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to stat staging entry");
                continue;
            }
        };
        let modified = meta.modified().unwrap_or(now);
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }

        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), age_secs = age.as_secs(), "removed stale staging entry");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove staging entry"),
        }
    }

    if removed > 0 {
        obs::inc_staging_swept(removed);
    }
    Ok(removed)
}
