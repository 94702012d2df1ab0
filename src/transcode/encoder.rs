use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::TranscodeError;
use crate::package::manifest::{MEDIA_PLAYLIST, SEGMENT_PATTERN};
use crate::transcode::profile::{rate_arg, RenditionSpec};

/// Lines of encoder stderr kept for failure reports.
const STDERR_TAIL_LINES: usize = 20;

/// GOP length in frames; fixed so every rendition cuts segments at the same points.
const GOP_FRAMES: u32 = 48;

/// One encoder invocation: a source file rendered into one rendition directory.
#[derive(Debug, Clone)]
pub struct RenditionJob {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub spec: RenditionSpec,
    pub segment_duration_secs: u32,
}

impl RenditionJob {
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(MEDIA_PLAYLIST)
    }
}

pub type EncodeFuture = Pin<Box<dyn Future<Output = Result<(), TranscodeError>> + Send>>;

/// External transcoding engine. On success the job's output directory holds
/// a media playlist and its numbered segments. Implementations must stop work
/// promptly once `cancel` fires and report `TranscodeError::Cancelled`.
pub trait Encoder: Send + Sync {
    fn encode(&self, job: RenditionJob, cancel: CancellationToken) -> EncodeFuture;
}

// ---------------------------------------------------------------------------
// ffmpeg
// ---------------------------------------------------------------------------

/// Production encoder driving the `ffmpeg` CLI, one process per rendition.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// ffmpeg arguments for one rendition: scale, H.264/AAC at the target
/// bitrates, fixed GOP, and VOD HLS output with every segment retained.
pub fn ffmpeg_args(job: &RenditionJob) -> Vec<String> {
    let spec = &job.spec;
    let segment_pattern = job.output_dir.join(SEGMENT_PATTERN);
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        job.input.to_string_lossy().into_owned(),
        "-vf".into(),
        format!("scale={}:{}", spec.width, spec.height),
        "-c:v".into(),
        "libx264".into(),
        "-profile:v".into(),
        "main".into(),
        "-preset".into(),
        "veryfast".into(),
        "-b:v".into(),
        rate_arg(spec.video_bitrate_bps),
        "-maxrate".into(),
        rate_arg(spec.video_bitrate_bps),
        "-bufsize".into(),
        rate_arg(spec.video_bitrate_bps * 2),
        "-g".into(),
        GOP_FRAMES.to_string(),
        "-keyint_min".into(),
        GOP_FRAMES.to_string(),
        "-sc_threshold".into(),
        "0".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        rate_arg(spec.audio_bitrate_bps),
        "-ac".into(),
        "2".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        job.segment_duration_secs.to_string(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_segment_filename".into(),
        segment_pattern.to_string_lossy().into_owned(),
        job.playlist_path().to_string_lossy().into_owned(),
    ]
}

impl Encoder for FfmpegEncoder {
    fn encode(&self, job: RenditionJob, cancel: CancellationToken) -> EncodeFuture {
        let program = self.program.clone();
        let timeout = self.timeout;
        Box::pin(async move { run_ffmpeg(program, timeout, job, cancel).await })
    }
}

async fn run_ffmpeg(
    program: PathBuf,
    timeout: Duration,
    job: RenditionJob,
    cancel: CancellationToken,
) -> Result<(), TranscodeError> {
    let rendition = job.spec.name.clone();
    let args = ffmpeg_args(&job);
    debug!(rendition = %rendition, program = %program.display(), ?args, "starting encoder");

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TranscodeError::Spawn {
            reason: format!("{}: {}", program.display(), e),
        })?;

    let stderr_tail = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        })
    });

    let started = Instant::now();
    let status = tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(rendition = %rendition, error = %e, "failed to kill cancelled encoder");
            }
            info!(rendition = %rendition, "encoder cancelled");
            return Err(TranscodeError::Cancelled { stream_name: rendition });
        }
        waited = tokio::time::timeout(timeout, child.wait()) => match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(TranscodeError::Io(e)),
            Err(_elapsed) => {
                if let Err(e) = child.kill().await {
                    warn!(rendition = %rendition, error = %e, "failed to kill timed-out encoder");
                }
                return Err(TranscodeError::Timeout {
                    rendition,
                    timeout_secs: timeout.as_secs(),
                });
            }
        },
    };

    let stderr = match stderr_tail {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };

    if !status.success() {
        return Err(TranscodeError::RenditionFailed {
            rendition,
            reason: if stderr.trim().is_empty() {
                format!("encoder exited with {}", status)
            } else {
                format!("encoder exited with {}: {}", status, stderr.trim())
            },
        });
    }

    debug!(
        rendition = %rendition,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "encoder finished"
    );
    Ok(())
}

/// Check that the encoder binary runs at all (`-version`), bounded by `timeout`.
pub async fn probe_encoder(program: &Path, timeout: Duration) -> bool {
    let probe = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    matches!(tokio::time::timeout(timeout, probe).await, Ok(Ok(status)) if status.success())
}
