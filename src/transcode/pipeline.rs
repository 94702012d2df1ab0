use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::TranscodeConfig;
use crate::core::error::TranscodeError;
use crate::core::security::validate_stream_name;
use crate::core::types::StreamRendition;
use crate::observability::metrics as obs;
use crate::package::manifest::{
    build_master, count_segments, finalize_media, master_playlist_path, MASTER_PLAYLIST,
};

use super::encoder::{Encoder, RenditionJob};
use super::profile::RenditionSpec;

// ---------------------------------------------------------------------------
// Transcoding orchestrator
// ---------------------------------------------------------------------------

/// Result of a successful `convert`: a complete package in a staging
/// directory, ready to be published under `stream_name/`.
#[derive(Debug, Clone)]
pub struct PackagingOutcome {
    pub stream_name: String,
    pub staging_dir: PathBuf,
    pub master_playlist_path: String,
    /// In request order.
    pub completed: Vec<StreamRendition>,
}

/// Drives one encoder invocation per rendition, concurrently, into a private
/// staging directory.
///
/// Ordering within one job:
/// - the master playlist is written before any encode starts
/// - a rendition's media playlist is finalized before it counts as completed
/// - the job resolves only after every rendition task has finished
///
/// The first failure cancels the job token, which every sibling encode
/// watches; the barrier still waits for all of them before reporting.
/// On any failure the staging tree is removed.
pub struct TranscodeOrchestrator {
    encoder: Arc<dyn Encoder>,
    work_dir: PathBuf,
    segment_duration_secs: u32,
}

impl TranscodeOrchestrator {
    pub fn new(encoder: Arc<dyn Encoder>, config: &TranscodeConfig) -> Self {
        Self {
            encoder,
            work_dir: config.work_dir.clone(),
            segment_duration_secs: config.segment_duration_secs,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Package `input` into renditions `specs` for stream `output_name`.
    ///
    /// `on_rendition` is called once per rendition as it completes.
    pub async fn convert(
        &self,
        input: &Path,
        output_name: &str,
        specs: &[RenditionSpec],
        cancel: CancellationToken,
        on_rendition: &(dyn Fn(&StreamRendition) + Send + Sync),
    ) -> Result<PackagingOutcome, TranscodeError> {
        validate_stream_name(output_name).map_err(|reason| TranscodeError::InvalidInput {
            reason: format!("output name {:?}: {}", output_name, reason),
        })?;
        if specs.is_empty() {
            return Err(TranscodeError::InvalidInput {
                reason: "at least one rendition is required".to_string(),
            });
        }
        match tokio::fs::metadata(input).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(TranscodeError::InvalidInput {
                    reason: format!("source {} is not a readable file", input.display()),
                })
            }
        }

        let staging = self
            .work_dir
            .join(format!("{}.{}", output_name, Uuid::new_v4().simple()));

        let started = Instant::now();
        obs::inc_transcode_active_jobs();
        let result = self
            .run(input, output_name, specs, &staging, &cancel, on_rendition)
            .await;
        obs::dec_transcode_active_jobs();

        match &result {
            Ok(outcome) => {
                obs::inc_transcode_jobs("completed");
                info!(
                    stream = %output_name,
                    renditions = outcome.completed.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "packaging finished"
                );
            }
            Err(e) => {
                obs::inc_transcode_jobs(if matches!(e, TranscodeError::Cancelled { .. }) {
                    "cancelled"
                } else {
                    "failed"
                });
                warn!(stream = %output_name, error = %e, "packaging failed, discarding staging tree");
                remove_staging(&staging).await;
            }
        }
        result
    }

    async fn run(
        &self,
        input: &Path,
        output_name: &str,
        specs: &[RenditionSpec],
        staging: &Path,
        cancel: &CancellationToken,
        on_rendition: &(dyn Fn(&StreamRendition) + Send + Sync),
    ) -> Result<PackagingOutcome, TranscodeError> {
        for spec in specs {
            tokio::fs::create_dir_all(staging.join(&spec.name)).await?;
        }

        let renditions: Vec<StreamRendition> =
            specs.iter().map(|s| s.to_rendition(output_name)).collect();
        tokio::fs::write(
            staging.join(MASTER_PLAYLIST),
            build_master(&renditions, output_name),
        )
        .await?;
        debug!(stream = %output_name, staging = %staging.display(), "master playlist written");

        let job_token = cancel.child_token();
        let mut tasks = JoinSet::new();
        for (index, spec) in specs.iter().enumerate() {
            let job = RenditionJob {
                input: input.to_path_buf(),
                output_dir: staging.join(&spec.name),
                spec: spec.clone(),
                segment_duration_secs: self.segment_duration_secs,
            };
            let encoder = Arc::clone(&self.encoder);
            let token = job_token.child_token();
            tasks.spawn(async move {
                let started = Instant::now();
                let result = encode_and_finalize(encoder.as_ref(), job, token).await;
                (index, started.elapsed(), result)
            });
        }

        let mut completed: Vec<Option<StreamRendition>> = vec![None; specs.len()];
        let mut first_error: Option<TranscodeError> = None;

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok((index, elapsed, result)) => {
                    obs::record_rendition_encode_duration(
                        &specs[index].name,
                        elapsed.as_secs_f64(),
                    );
                    (Some(index), result)
                }
                Err(e) => (
                    None,
                    Err(TranscodeError::RenditionFailed {
                        rendition: "unknown".to_string(),
                        reason: format!("encoder task aborted: {}", e),
                    }),
                ),
            };

            match (index, result) {
                (Some(index), Ok(())) => {
                    let rendition = &renditions[index];
                    debug!(stream = %output_name, rendition = %rendition.name, "rendition completed");
                    on_rendition(rendition);
                    completed[index] = Some(rendition.clone());
                }
                (_, Err(e)) => {
                    if first_error.is_none() {
                        warn!(stream = %output_name, error = %e, "rendition failed, cancelling siblings");
                        job_token.cancel();
                        first_error = Some(e);
                    } else {
                        debug!(stream = %output_name, error = %e, "sibling rendition stopped");
                    }
                }
                (None, Ok(())) => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(TranscodeError::Cancelled {
                stream_name: output_name.to_string(),
            });
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(PackagingOutcome {
            stream_name: output_name.to_string(),
            staging_dir: staging.to_path_buf(),
            master_playlist_path: master_playlist_path(output_name),
            completed: completed.into_iter().flatten().collect(),
        })
    }
}

async fn encode_and_finalize(
    encoder: &dyn Encoder,
    job: RenditionJob,
    cancel: CancellationToken,
) -> Result<(), TranscodeError> {
    let rendition = job.spec.name.clone();
    let playlist_path = job.playlist_path();
    encoder.encode(job, cancel).await?;

    let playlist = match tokio::fs::read_to_string(&playlist_path).await {
        Ok(playlist) => playlist,
        Err(e) => {
            return Err(TranscodeError::RenditionFailed {
                rendition,
                reason: format!("encoder produced no media playlist: {}", e),
            })
        }
    };
    let segments = count_segments(&playlist);
    if segments == 0 {
        return Err(TranscodeError::RenditionFailed {
            rendition,
            reason: "media playlist lists no segments".to_string(),
        });
    }
    tokio::fs::write(&playlist_path, finalize_media(&playlist)).await?;
    debug!(%rendition, segments, "media playlist finalized");
    Ok(())
}

async fn remove_staging(staging: &Path) {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(staging = %staging.display(), error = %e, "failed to remove staging tree"),
    }
}
