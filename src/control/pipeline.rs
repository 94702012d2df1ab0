use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::config::TranscodeConfig;
use crate::core::error::{CatalogError, PackagingError, StorageError, TranscodeError};
use crate::core::security::{derive_stream_name, validate_object_name, validate_stream_name};
use crate::core::types::{JobId, SourceBackend, StreamRendition};
use crate::package::manifest::stream_prefix;
use crate::storage::{ContentStore, StoreBackend};
use crate::transcode::encoder::Encoder;
use crate::transcode::pipeline::TranscodeOrchestrator;
use crate::transcode::profile::{specs_from_ladder, RenditionSpec};

use super::catalog::StreamCatalog;
use super::jobs::{JobEntry, JobRegistry, JobState};

// ---------------------------------------------------------------------------
// Source stores
// ---------------------------------------------------------------------------

/// The backends uploads live in and packaging reads from.
#[derive(Clone)]
pub struct SourceStores {
    pub local: Arc<StoreBackend>,
    /// Absent when no object store is configured.
    pub remote: Option<Arc<StoreBackend>>,
}

impl SourceStores {
    pub fn get(&self, backend: SourceBackend) -> Option<&Arc<StoreBackend>> {
        match backend {
            SourceBackend::Local => Some(&self.local),
            SourceBackend::Remote => self.remote.as_ref(),
        }
    }
}

/// Body of `POST /api/v1/streams`.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageRequest {
    pub source: String,
    #[serde(default)]
    pub source_backend: SourceBackend,
    /// Defaults to `<source stem>_<unix millis>`.
    #[serde(default)]
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Packaging service
// ---------------------------------------------------------------------------

/// Accepts packaging requests and runs them in the background:
/// source resolution, transcoding into staging, publication to the package
/// backend, catalog invalidation.
///
/// At most `max_concurrent_jobs` jobs transcode at once; the rest wait in
/// QUEUED. Every job runs on a child of the service token, so cancelling it
/// (shutdown) kills all encoders and discards all staging trees.
pub struct PackagingService {
    orchestrator: TranscodeOrchestrator,
    sources: SourceStores,
    packages: Arc<StoreBackend>,
    catalog: Arc<StreamCatalog<StoreBackend>>,
    jobs: Arc<JobRegistry>,
    specs: Vec<RenditionSpec>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl PackagingService {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        config: &TranscodeConfig,
        sources: SourceStores,
        packages: Arc<StoreBackend>,
        catalog: Arc<StreamCatalog<StoreBackend>>,
        jobs: Arc<JobRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator: TranscodeOrchestrator::new(encoder, config),
            sources,
            packages,
            catalog,
            jobs,
            specs: specs_from_ladder(&config.rendition_ladder),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Validate a request and queue its job. Returns as soon as the job is
    /// registered; the work itself happens in the background.
    pub async fn submit(self: &Arc<Self>, request: PackageRequest) -> Result<JobEntry, PackagingError> {
        if self.cancel.is_cancelled() {
            return Err(PackagingError::Unavailable {
                reason: "shutting down".to_string(),
            });
        }

        validate_object_name(&request.source).map_err(|reason| PackagingError::InvalidInput {
            reason: format!("source {:?}: {}", request.source, reason),
        })?;
        let store = self
            .sources
            .get(request.source_backend)
            .ok_or_else(|| PackagingError::Unavailable {
                reason: "remote object store is not configured".to_string(),
            })?;
        match store.stat(&request.source).await {
            Ok(meta) => debug!(source = %request.source, size = meta.size_bytes, "packaging source found"),
            Err(StorageError::NotFound { name }) => return Err(PackagingError::SourceNotFound { name }),
            Err(e) => return Err(e.into()),
        }

        let stream_name = match &request.name {
            Some(name) => name.clone(),
            None => derive_stream_name(&request.source, Utc::now().timestamp_millis()),
        };
        validate_stream_name(&stream_name).map_err(|reason| PackagingError::InvalidInput {
            reason: format!("stream name {:?}: {}", stream_name, reason),
        })?;

        match self.catalog.exists(&stream_name).await {
            Ok(false) => {}
            Ok(true) => return Err(PackagingError::Conflict { name: stream_name }),
            Err(CatalogError::Storage(e)) => return Err(e.into()),
            Err(e) => {
                return Err(PackagingError::InvalidInput {
                    reason: e.to_string(),
                })
            }
        }

        let renditions = self.specs.iter().map(|s| s.name.clone()).collect();
        let job = self
            .jobs
            .try_create(&stream_name, &request.source, request.source_backend, renditions)
            .ok_or_else(|| PackagingError::Conflict {
                name: stream_name.clone(),
            })?;

        let this = Arc::clone(self);
        let job_id = job.job_id;
        self.tracker.spawn(async move {
            this.run_job(job_id, stream_name, request).await;
        });

        Ok(job)
    }

    /// Stop accepting jobs and wait (bounded) for running ones to wind down.
    /// Callers cancel the service token first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "packaging jobs still running after {}s",
                    timeout.as_secs()
                );
                false
            }
        }
    }

    async fn run_job(&self, job_id: JobId, stream_name: String, request: PackageRequest) {
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.set_failed(job_id, "packaging service closed");
                    return;
                }
            },
            _ = self.cancel.cancelled() => {
                self.set_state(job_id, JobState::Cancelled);
                return;
            }
        };
        self.set_state(job_id, JobState::Processing);

        let (input, downloaded) = match self.resolve_source(job_id, &request).await {
            Ok(resolved) => resolved,
            Err(e) => {
                self.set_failed(job_id, format!("source {}: {}", request.source, e));
                return;
            }
        };

        let jobs = Arc::clone(&self.jobs);
        let progress = move |rendition: &StreamRendition| {
            jobs.record_rendition(job_id, &rendition.name);
        };
        let result = self
            .orchestrator
            .convert(
                &input,
                &stream_name,
                &self.specs,
                self.cancel.child_token(),
                &progress,
            )
            .await;

        if let Some(tmp) = downloaded {
            remove_path(&tmp).await;
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(TranscodeError::Cancelled { .. }) => {
                self.set_state(job_id, JobState::Cancelled);
                return;
            }
            Err(e) => {
                self.set_failed(job_id, e.to_string());
                return;
            }
        };

        self.set_state(job_id, JobState::Publishing);
        let published = self.packages.publish(&outcome.staging_dir, &stream_name).await;
        remove_path(&outcome.staging_dir).await;

        match published {
            Ok(objects) => {
                self.catalog.invalidate(&stream_name);
                info!(%job_id, stream = %stream_name, objects, "stream published");
                self.set_state(job_id, JobState::Ready);
            }
            Err(source) => {
                if !matches!(source, StorageError::AlreadyExists { .. }) {
                    // Master goes up last, so a partial upload is never listed;
                    // remove it anyway.
                    if let Err(e) = self.packages.delete_prefix(&stream_prefix(&stream_name)).await {
                        warn!(%job_id, stream = %stream_name, error = %e, "failed to clean up partial publish");
                    }
                }
                let err = TranscodeError::Publish {
                    stream_name: stream_name.clone(),
                    source,
                };
                self.set_failed(job_id, err.to_string());
            }
        }
    }

    /// Path the encoder reads. Local sources are used in place; remote ones
    /// are downloaded into the work directory first (and returned for removal).
    async fn resolve_source(
        &self,
        job_id: JobId,
        request: &PackageRequest,
    ) -> Result<(PathBuf, Option<PathBuf>), StorageError> {
        let store = self
            .sources
            .get(request.source_backend)
            .ok_or(StorageError::Unsupported {
                backend: "remote",
                operation: "packaging source",
            })?;
        if let Some(path) = store.local_path(&request.source)? {
            return Ok((path, None));
        }

        let work_dir = self.orchestrator.work_dir();
        tokio::fs::create_dir_all(work_dir).await?;
        let extension = request
            .source
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{}", ext))
            .unwrap_or_default();
        let target = work_dir.join(format!("{}.source{}", job_id, extension));

        let mut body = store.open_full(&request.source).await?;
        let mut file = tokio::fs::File::create(&target).await?;
        let copied = tokio::io::copy(&mut body.reader, &mut file).await;
        let copied = match copied {
            Ok(copied) => copied,
            Err(e) => {
                remove_path(&target).await;
                return Err(StorageError::Io(e));
            }
        };
        if copied != body.length {
            remove_path(&target).await;
            return Err(StorageError::Backend {
                operation: "download",
                name: request.source.clone(),
                reason: format!("expected {} bytes, got {}", body.length, copied),
            });
        }

        debug!(%job_id, source = %request.source, bytes = copied, "remote source downloaded");
        Ok((target.clone(), Some(target)))
    }

    fn set_state(&self, job_id: JobId, state: JobState) {
        if let Err(e) = self.jobs.transition(job_id, state) {
            warn!(%job_id, error = %e, "job state update rejected");
        }
    }

    fn set_failed(&self, job_id: JobId, message: impl Into<String>) {
        if let Err(e) = self.jobs.fail(job_id, message) {
            warn!(%job_id, error = %e, "job state update rejected");
        }
    }
}

async fn remove_path(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to remove work file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CatalogConfig;
    use crate::storage::{InMemoryStore, LocalStore};
    use crate::transcode::pipeline::tests::{Script, ScriptedEncoder};
    use bytes::Bytes;

    struct Harness {
        _dir: tempfile::TempDir,
        work_dir: PathBuf,
        packages: Arc<StoreBackend>,
        catalog: Arc<StreamCatalog<StoreBackend>>,
        service: Arc<PackagingService>,
        cancel: CancellationToken,
    }

    async fn harness(encoder: ScriptedEncoder, remote: Option<InMemoryStore>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        let local = LocalStore::new(dir.path().join("videos"));
        local.ensure_root().await.unwrap();
        local
            .put("clip.mp4", Bytes::from_static(b"fake video"), "video/mp4")
            .await
            .unwrap();

        let packages = Arc::new(StoreBackend::Memory(InMemoryStore::new()));
        let config = TranscodeConfig {
            work_dir: work_dir.clone(),
            ..TranscodeConfig::default()
        };
        let catalog = Arc::new(StreamCatalog::new(
            Arc::clone(&packages),
            &CatalogConfig::default(),
            config.rendition_ladder.clone(),
        ));
        let cancel = CancellationToken::new();
        let service = Arc::new(PackagingService::new(
            Arc::new(encoder),
            &config,
            SourceStores {
                local: Arc::new(StoreBackend::Local(local)),
                remote: remote.map(|store| Arc::new(StoreBackend::Memory(store))),
            },
            Arc::clone(&packages),
            Arc::clone(&catalog),
            Arc::new(JobRegistry::new()),
            cancel.clone(),
        ));
        Harness {
            _dir: dir,
            work_dir,
            packages,
            catalog,
            service,
            cancel,
        }
    }

    fn request(source: &str, name: Option<&str>) -> PackageRequest {
        PackageRequest {
            source: source.to_string(),
            source_backend: SourceBackend::Local,
            name: name.map(str::to_string),
        }
    }

    async fn wait_for_terminal(service: &PackagingService, job_id: JobId) -> JobEntry {
        for _ in 0..400 {
            let entry = service.jobs().get(job_id).unwrap();
            if entry.state.is_terminal() {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {job_id} did not finish");
    }

    async fn work_dir_is_empty(dir: &Path) -> bool {
        match tokio::fs::read_dir(dir).await {
            Ok(mut entries) => entries.next_entry().await.unwrap().is_none(),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn test_job_publishes_stream() {
        let h = harness(ScriptedEncoder::succeeding(), None).await;
        let job = h.service.submit(request("clip.mp4", Some("clip"))).await.unwrap();
        assert_eq!(job.state, JobState::Queued);

        let done = wait_for_terminal(&h.service, job.job_id).await;
        assert_eq!(done.state, JobState::Ready, "{:?}", done.error_message);
        assert_eq!(done.completed_renditions.len(), 3);

        assert!(h.catalog.exists("clip").await.unwrap());
        let stream = h.catalog.inspect("clip").await.unwrap();
        assert_eq!(stream.renditions.len(), 3);

        let StoreBackend::Memory(store) = h.packages.as_ref() else {
            unreachable!()
        };
        let order = store.write_order().await;
        assert_eq!(order.last().map(String::as_str), Some("clip/master.m3u8"));
        assert!(work_dir_is_empty(&h.work_dir).await);
    }

    #[tokio::test]
    async fn test_default_name_is_timestamped() {
        let h = harness(ScriptedEncoder::succeeding(), None).await;
        let job = h.service.submit(request("clip.mp4", None)).await.unwrap();
        let (stem, millis) = job.stream_name.rsplit_once('_').unwrap();
        assert_eq!(stem, "clip");
        assert!(millis.parse::<i64>().is_ok());
        wait_for_terminal(&h.service, job.job_id).await;
    }

    #[tokio::test]
    async fn test_failed_rendition_publishes_nothing() {
        let h = harness(
            ScriptedEncoder::new(&[("480p", Script::Fail { after_ms: 20 })]),
            None,
        )
        .await;
        let job = h.service.submit(request("clip.mp4", Some("clip"))).await.unwrap();
        let done = wait_for_terminal(&h.service, job.job_id).await;

        assert_eq!(done.state, JobState::Failed);
        assert!(done.error_message.unwrap().contains("480p"));
        assert!(!h.catalog.exists("clip").await.unwrap());
        assert!(h.packages.list("").await.unwrap().is_empty());
        assert!(work_dir_is_empty(&h.work_dir).await);
    }

    #[tokio::test]
    async fn test_rejected_requests() {
        let h = harness(ScriptedEncoder::succeeding(), None).await;

        assert!(matches!(
            h.service.submit(request("missing.mp4", None)).await,
            Err(PackagingError::SourceNotFound { .. })
        ));
        assert!(matches!(
            h.service.submit(request("../clip.mp4", None)).await,
            Err(PackagingError::InvalidInput { .. })
        ));
        assert!(matches!(
            h.service.submit(request("clip.mp4", Some("bad/name"))).await,
            Err(PackagingError::InvalidInput { .. })
        ));
        let remote = PackageRequest {
            source_backend: SourceBackend::Remote,
            ..request("clip.mp4", None)
        };
        assert!(matches!(
            h.service.submit(remote).await,
            Err(PackagingError::Unavailable { .. })
        ));

        let job = h.service.submit(request("clip.mp4", Some("clip"))).await.unwrap();
        wait_for_terminal(&h.service, job.job_id).await;
        assert!(matches!(
            h.service.submit(request("clip.mp4", Some("clip"))).await,
            Err(PackagingError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_source_is_downloaded_then_removed() {
        let remote = InMemoryStore::new();
        remote
            .put("uploads/talk.mov", Bytes::from_static(b"remote video"), "video/quicktime")
            .await
            .unwrap();
        let h = harness(ScriptedEncoder::succeeding(), Some(remote)).await;

        let job = h
            .service
            .submit(PackageRequest {
                source: "uploads/talk.mov".to_string(),
                source_backend: SourceBackend::Remote,
                name: None,
            })
            .await
            .unwrap();
        assert!(job.stream_name.starts_with("talk_"));

        let done = wait_for_terminal(&h.service, job.job_id).await;
        assert_eq!(done.state, JobState::Ready, "{:?}", done.error_message);
        assert!(work_dir_is_empty(&h.work_dir).await);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_job() {
        let h = harness(
            ScriptedEncoder::new(&[
                ("720p", Script::Succeed { after_ms: 30_000 }),
                ("480p", Script::Succeed { after_ms: 30_000 }),
                ("360p", Script::Succeed { after_ms: 30_000 }),
            ]),
            None,
        )
        .await;
        let job = h.service.submit(request("clip.mp4", Some("clip"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.cancel.cancel();
        assert!(h.service.drain(Duration::from_secs(5)).await);

        let done = h.service.jobs().get(job.job_id).unwrap();
        assert_eq!(done.state, JobState::Cancelled);
        assert!(work_dir_is_empty(&h.work_dir).await);
        assert!(matches!(
            h.service.submit(request("clip.mp4", Some("later"))).await,
            Err(PackagingError::Unavailable { .. })
        ));
    }
}
