use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::control::catalog::StreamCatalog;
use crate::control::pipeline::{PackagingService, SourceStores};
use crate::core::config::{AppConfig, DeliveryConfig};
use crate::storage::StoreBackend;

use super::handlers;
use super::middleware::{RequestIdLayer, X_REQUEST_ID};

// ---------------------------------------------------------------------------
// HTTP router
// ---------------------------------------------------------------------------

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Upload backends served under `/videos/*`.
    pub sources: SourceStores,
    /// Where packaged streams are published and served from.
    pub packages: Arc<StoreBackend>,
    pub catalog: Arc<StreamCatalog<StoreBackend>>,
    pub packaging: Arc<PackagingService>,
    pub config: Arc<AppConfig>,
    pub start_time: Instant,
    /// Prometheus metrics handle for rendering /metrics endpoint.
    pub metrics_handle: PrometheusHandle,
}

/// Build the full Axum router with all routes.
///
/// **Content delivery (`GET` and `HEAD`, single-range aware):**
/// - `/videos/local/{*name}`
/// - `/videos/remote/{*name}`
/// - `/streams/{name}/master.m3u8`
/// - `/streams/{name}/{rendition}/playlist.m3u8`
/// - `/streams/{name}/{rendition}/{segment}`
///
/// **Objects:**
/// - `GET  /api/v1/videos/{local|remote}`:            list, `?prefix=`
/// - `PUT  /api/v1/videos/{local|remote}/{*name}`:    upload
/// - `GET  /api/v1/videos/remote/url/{*name}`:        presigned URL
///
/// **Streams and jobs:**
/// - `POST   /api/v1/streams`:        queue packaging, 202
/// - `GET    /api/v1/streams`
/// - `GET    /api/v1/streams/{name}`
/// - `DELETE /api/v1/streams/{name}`
/// - `GET    /api/v1/jobs`, `GET /api/v1/jobs/{job_id}`
///
/// **Health:** `/healthz`, `/readyz`, `/metrics`
pub fn build_router(state: AppState) -> Router {
    let delivery = &state.config.delivery;
    tracing::info!(
        cache_control_playlist = %delivery.cache_control_playlist,
        cache_control_segment = %delivery.cache_control_segment,
        cors_origins = ?delivery.cors_allowed_origins,
        max_upload_bytes = delivery.max_upload_bytes,
        "delivery configuration loaded"
    );
    let cors = cors_layer(delivery);
    let body_limit = DefaultBodyLimit::max(delivery.max_upload_bytes);

    Router::new()
        // Content delivery
        .route("/videos/local/{*name}", get(handlers::serve_local_video))
        .route("/videos/remote/{*name}", get(handlers::serve_remote_video))
        .route(
            "/streams/{name}/master.m3u8",
            get(handlers::serve_master_playlist),
        )
        .route(
            "/streams/{name}/{rendition}/playlist.m3u8",
            get(handlers::serve_media_playlist),
        )
        .route(
            "/streams/{name}/{rendition}/{segment}",
            get(handlers::serve_segment),
        )
        // Object API
        .route("/api/v1/videos/local", get(handlers::list_local_videos))
        .route(
            "/api/v1/videos/local/{*name}",
            axum::routing::put(handlers::upload_local_video),
        )
        .route("/api/v1/videos/remote", get(handlers::list_remote_videos))
        .route(
            "/api/v1/videos/remote/{*name}",
            get(handlers::presign_remote_video).put(handlers::upload_remote_video),
        )
        // Streams and jobs
        .route(
            "/api/v1/streams",
            get(handlers::list_streams).post(handlers::create_stream),
        )
        .route(
            "/api/v1/streams/{name}",
            get(handlers::get_stream).delete(handlers::delete_stream),
        )
        .route("/api/v1/jobs", get(handlers::list_jobs))
        .route("/api/v1/jobs/{job_id}", get(handlers::get_job))
        // Health
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(cors)
        .layer(body_limit)
        .layer(RequestIdLayer)
        .with_state(state)
}

fn cors_layer(delivery: &DeliveryConfig) -> CorsLayer {
    let origins = &delivery.cors_allowed_origins;
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(%origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::PUT,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::RANGE, header::CONTENT_TYPE])
        .expose_headers([
            header::CONTENT_LENGTH,
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
            header::ETAG,
            X_REQUEST_ID.clone(),
        ])
        .max_age(Duration::from_secs(86400))
}
