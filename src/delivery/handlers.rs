use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::control::catalog::Stream;
use crate::control::jobs::{JobEntry, JobState};
use crate::control::pipeline::PackageRequest;
use crate::core::error::DeliveryError;
use crate::core::security::{
    is_allowed_upload, validate_object_name, validate_presign_expiry, validate_prefix,
    DEFAULT_LIST_LIMIT, DEFAULT_PRESIGN_EXPIRY_SECS, MAX_LIST_LIMIT, MAX_PRESIGN_EXPIRY_SECS,
    SEGMENT_EXTENSION,
};
use crate::core::types::{JobId, SourceBackend};
use crate::observability::metrics as obs;
use crate::package::manifest::{master_playlist_path, media_playlist_path, segment_path};
use crate::storage::{content_type_for_path, ContentStore, ObjectMetadata, StoreBackend};
use crate::transcode::encoder::probe_encoder;

use super::router::AppState;
use super::serve::serve_object;

/// Prefix the readiness probe lists under; never holds objects.
const READINESS_PROBE_PREFIX: &str = "__readyz__/";

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    status: u16,
}

fn error_json(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
        status: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        error_json(status, self.error_code(), &self.to_string())
    }
}

fn source_store(state: &AppState, backend: SourceBackend) -> Result<&StoreBackend, DeliveryError> {
    state
        .sources
        .get(backend)
        .map(|store| store.as_ref())
        .ok_or_else(|| DeliveryError::Unavailable {
            reason: format!("no {} backend is configured", backend.as_str()),
        })
}

// ---------------------------------------------------------------------------
// Object delivery
// ---------------------------------------------------------------------------

/// `GET|HEAD /videos/local/{*name}`
pub async fn serve_local_video(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    serve_source(&state, SourceBackend::Local, &name, &method, &headers).await
}

/// `GET|HEAD /videos/remote/{*name}`
pub async fn serve_remote_video(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    serve_source(&state, SourceBackend::Remote, &name, &method, &headers).await
}

async fn serve_source(
    state: &AppState,
    backend: SourceBackend,
    name: &str,
    method: &Method,
    headers: &HeaderMap,
) -> Response {
    let store = match source_store(state, backend) {
        Ok(store) => store,
        Err(e) => return e.into_response(),
    };
    if let Err(reason) = validate_object_name(name) {
        return DeliveryError::InvalidInput { reason }.into_response();
    }
    serve_object(store, name, method, headers, &state.config.delivery).await
}

/// `GET /streams/{name}/master.m3u8`
pub async fn serve_master_playlist(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let path = master_playlist_path(&name);
    serve_package(&state, &path, &method, &headers).await
}

/// `GET /streams/{name}/{rendition}/playlist.m3u8`
pub async fn serve_media_playlist(
    State(state): State<AppState>,
    Path((name, rendition)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let path = media_playlist_path(&name, &rendition);
    serve_package(&state, &path, &method, &headers).await
}

/// `GET /streams/{name}/{rendition}/{segment}`. Only `.ts` segments are served.
pub async fn serve_segment(
    State(state): State<AppState>,
    Path((name, rendition, segment)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if !segment.ends_with(SEGMENT_EXTENSION) {
        return error_json(
            StatusCode::BAD_REQUEST,
            "invalid_segment",
            &format!("segment names must end with {}", SEGMENT_EXTENSION),
        );
    }
    let path = segment_path(&name, &rendition, &segment);
    serve_package(&state, &path, &method, &headers).await
}

async fn serve_package(state: &AppState, path: &str, method: &Method, headers: &HeaderMap) -> Response {
    if let Err(reason) = validate_object_name(path) {
        return DeliveryError::InvalidInput { reason }.into_response();
    }
    serve_object(state.packages.as_ref(), path, method, headers, &state.config.delivery).await
}

// ---------------------------------------------------------------------------
// Object API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    #[serde(default)]
    pub prefix: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ObjectListResponse {
    backend: &'static str,
    prefix: String,
    objects: Vec<ObjectMetadata>,
    total: usize,
    limit: usize,
    offset: usize,
}

/// `GET /api/v1/videos/local`
pub async fn list_local_videos(
    State(state): State<AppState>,
    Query(query): Query<ListObjectsQuery>,
) -> Response {
    list_objects(&state, SourceBackend::Local, query).await
}

/// `GET /api/v1/videos/remote`
pub async fn list_remote_videos(
    State(state): State<AppState>,
    Query(query): Query<ListObjectsQuery>,
) -> Response {
    list_objects(&state, SourceBackend::Remote, query).await
}

async fn list_objects(state: &AppState, backend: SourceBackend, query: ListObjectsQuery) -> Response {
    let result = async {
        let store = source_store(state, backend)?;
        validate_prefix(&query.prefix).map_err(|reason| DeliveryError::InvalidInput { reason })?;
        Ok::<_, DeliveryError>(store.list(&query.prefix).await?)
    }
    .await;

    let all = match result {
        Ok(all) => all,
        Err(e) => return e.into_response(),
    };
    let (limit, offset) = page(query.limit, query.offset);
    let total = all.len();
    let objects = all.into_iter().skip(offset).take(limit).collect();

    Json(ObjectListResponse {
        backend: backend.as_str(),
        prefix: query.prefix,
        objects,
        total,
        limit,
        offset,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    backend: &'static str,
    name: String,
    etag: String,
    size_bytes: u64,
}

/// `PUT /api/v1/videos/local/{*name}`
pub async fn upload_local_video(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    upload(&state, SourceBackend::Local, &name, &headers, body).await
}

/// `PUT /api/v1/videos/remote/{*name}`
pub async fn upload_remote_video(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    upload(&state, SourceBackend::Remote, &name, &headers, body).await
}

async fn upload(
    state: &AppState,
    backend: SourceBackend,
    name: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let store = match source_store(state, backend) {
        Ok(store) => store,
        Err(e) => return e.into_response(),
    };
    if let Err(reason) = validate_object_name(name) {
        return DeliveryError::InvalidInput { reason }.into_response();
    }
    if !is_allowed_upload(name, &state.config.delivery.allowed_upload_extensions) {
        return error_json(
            StatusCode::BAD_REQUEST,
            "unsupported_media_type",
            &format!(
                "{} does not have an allowed extension ({})",
                name,
                state.config.delivery.allowed_upload_extensions.join(", ")
            ),
        );
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|ct| !ct.is_empty())
        .unwrap_or_else(|| content_type_for_path(name))
        .to_string();
    let size_bytes = body.len() as u64;

    match store.put(name, body, &content_type).await {
        Ok(etag) => {
            obs::add_upload_bytes(backend.as_str(), size_bytes);
            info!(backend = backend.as_str(), %name, size_bytes, "video uploaded");
            (
                StatusCode::CREATED,
                Json(UploadResponse {
                    backend: backend.as_str(),
                    name: name.to_string(),
                    etag,
                    size_bytes,
                }),
            )
                .into_response()
        }
        Err(e) => DeliveryError::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct PresignQuery {
    pub expires_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PresignResponse {
    name: String,
    url: String,
    expires_secs: u64,
    expires_at: String,
}

/// `GET /api/v1/videos/remote/url/{*name}`: a time-limited direct download
/// URL from the remote object store.
///
/// Shares its route with remote uploads, so the `url/` prefix arrives as part
/// of the wildcard.
pub async fn presign_remote_video(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<PresignQuery>,
) -> Response {
    let Some(name) = path.strip_prefix("url/") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let expires_secs = query.expires_secs.unwrap_or(DEFAULT_PRESIGN_EXPIRY_SECS);
    let max_secs = state
        .config
        .storage
        .s3
        .as_ref()
        .map(|s3| s3.max_presign_expiry_secs)
        .unwrap_or(MAX_PRESIGN_EXPIRY_SECS);

    let result = async {
        let store = source_store(&state, SourceBackend::Remote)?;
        validate_object_name(name).map_err(|reason| DeliveryError::InvalidInput { reason })?;
        validate_presign_expiry(expires_secs, max_secs)
            .map_err(|reason| DeliveryError::InvalidInput { reason })?;
        store.stat(name).await?;
        Ok::<_, DeliveryError>(
            store
                .presign_get(name, Duration::from_secs(expires_secs))
                .await?,
        )
    }
    .await;

    match result {
        Ok(url) => {
            debug!(%name, expires_secs, "presigned url issued");
            let expires_at = Utc::now() + chrono::Duration::seconds(expires_secs as i64);
            Json(PresignResponse {
                name: name.to_string(),
                url,
                expires_secs,
                expires_at: expires_at.to_rfc3339(),
            })
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Stream API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CreateStreamResponse {
    job_id: String,
    stream_name: String,
    status: &'static str,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct StreamListResponse {
    streams: Vec<Stream>,
    total: usize,
    limit: usize,
    offset: usize,
}

#[derive(Debug, Serialize)]
struct StreamDetailResponse {
    #[serde(flatten)]
    stream: Stream,
    playback_url: String,
}

#[derive(Debug, Serialize)]
struct DeleteStreamResponse {
    name: String,
    status: &'static str,
    objects_deleted: u64,
}

/// `POST /api/v1/streams`: queue a packaging job. Answers 202 once the job is
/// registered; progress is visible under `/api/v1/jobs/{id}`.
pub async fn create_stream(
    State(state): State<AppState>,
    Json(request): Json<PackageRequest>,
) -> Response {
    match state.packaging.submit(request).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(CreateStreamResponse {
                job_id: job.job_id.to_string(),
                stream_name: job.stream_name,
                status: JobState::Processing.as_str(),
                created_at: job.created_at.to_rfc3339(),
            }),
        )
            .into_response(),
        Err(e) => DeliveryError::from(e).into_response(),
    }
}

/// `GET /api/v1/streams`
pub async fn list_streams(State(state): State<AppState>, Query(query): Query<PageQuery>) -> Response {
    let all = match state.catalog.list().await {
        Ok(all) => all,
        Err(e) => return DeliveryError::from(e).into_response(),
    };
    let (limit, offset) = page(query.limit, query.offset);
    let total = all.len();
    let streams = all.into_iter().skip(offset).take(limit).collect();
    Json(StreamListResponse {
        streams,
        total,
        limit,
        offset,
    })
    .into_response()
}

/// `GET /api/v1/streams/{name}`
pub async fn get_stream(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.catalog.inspect(&name).await {
        Ok(stream) => {
            let playback_url = format!("/streams/{}", stream.master_playlist_path);
            Json(StreamDetailResponse {
                stream,
                playback_url,
            })
            .into_response()
        }
        Err(e) => DeliveryError::from(e).into_response(),
    }
}

/// `DELETE /api/v1/streams/{name}`. Refused while a job is still producing
/// the stream. The name stays claimed until the delete finishes so no job can
/// start on it midway.
pub async fn delete_stream(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(_claim) = state.packaging.jobs().claim_for_delete(&name) else {
        return DeliveryError::Conflict {
            reason: format!("stream {name} is being packaged or deleted"),
        }
        .into_response();
    };
    match state.catalog.delete(&name).await {
        Ok(objects_deleted) => {
            info!(stream = %name, objects_deleted, "stream deleted");
            Json(DeleteStreamResponse {
                name,
                status: "deleted",
                objects_deleted,
            })
            .into_response()
        }
        Err(e) => DeliveryError::from(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Job API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JobListResponse {
    jobs: Vec<JobEntry>,
    total: usize,
    limit: usize,
    offset: usize,
}

/// `GET /api/v1/jobs`
pub async fn list_jobs(State(state): State<AppState>, Query(query): Query<ListJobsQuery>) -> Response {
    let filter = match query.state.as_deref() {
        None => None,
        Some(raw) => match JobState::ALL.into_iter().find(|s| s.as_str() == raw) {
            Some(parsed) => Some(parsed),
            None => {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    "invalid_state",
                    &format!("unknown job state {raw:?}"),
                )
            }
        },
    };

    let all = state.packaging.jobs().list(filter);
    let (limit, offset) = page(query.limit, query.offset);
    let total = all.len();
    let jobs = all.into_iter().skip(offset).take(limit).collect();
    Json(JobListResponse {
        jobs,
        total,
        limit,
        offset,
    })
    .into_response()
}

/// `GET /api/v1/jobs/{job_id}`
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let Ok(uuid) = job_id.parse::<uuid::Uuid>() else {
        return error_json(
            StatusCode::BAD_REQUEST,
            "invalid_job_id",
            "Invalid job ID format.",
        );
    };
    match state.packaging.jobs().get(JobId::from_uuid(uuid)) {
        Some(job) => Json(job).into_response(),
        None => error_json(
            StatusCode::NOT_FOUND,
            "job_not_found",
            &format!("Job '{}' not found.", job_id),
        ),
    }
}

fn page(limit: Option<usize>, offset: Option<usize>) -> (usize, usize) {
    (
        limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT),
        offset.unwrap_or(0),
    )
}

// ---------------------------------------------------------------------------
// Health endpoints
// ---------------------------------------------------------------------------

/// `GET /metrics`: Prometheus text exposition format.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    let metrics = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics,
    )
        .into_response()
}

/// `GET /healthz`: liveness probe.
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = state.start_time.elapsed().as_secs();
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /readyz`: readiness probe.
///
/// Checks that the package backend answers a listing, that the remote
/// backend does too when configured, and that the encoder binary runs.
pub async fn readyz(State(state): State<AppState>) -> Response {
    let mut checks = serde_json::Map::new();
    let mut all_ok = true;

    let mut stores = vec![("packages", state.packages.as_ref())];
    if let Some(remote) = state.sources.remote.as_deref() {
        stores.push(("remote", remote));
    }
    for (label, store) in stores {
        match store.list(READINESS_PROBE_PREFIX).await {
            Ok(_) => {
                checks.insert(label.to_string(), serde_json::json!({"status": "ok"}));
            }
            Err(e) => {
                all_ok = false;
                checks.insert(
                    label.to_string(),
                    serde_json::json!({"status": "error", "error": e.to_string()}),
                );
            }
        }
    }

    let ffmpeg = &state.config.transcode.ffmpeg_path;
    if probe_encoder(std::path::Path::new(ffmpeg), Duration::from_secs(5)).await {
        checks.insert("ffmpeg".to_string(), serde_json::json!({"status": "ok"}));
    } else {
        all_ok = false;
        checks.insert(
            "ffmpeg".to_string(),
            serde_json::json!({
                "status": "error",
                "error": format!("{} -version failed", ffmpeg),
            }),
        );
    }

    let (status, http_status) = if all_ok {
        ("ready", StatusCode::OK)
    } else {
        ("not_ready", StatusCode::SERVICE_UNAVAILABLE)
    };
    (
        http_status,
        Json(serde_json::json!({
            "status": status,
            "checks": checks,
        })),
    )
        .into_response()
}
