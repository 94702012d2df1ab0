use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{error, info, warn};

use hlsvault::control::catalog::StreamCatalog;
use hlsvault::control::jobs::JobRegistry;
use hlsvault::control::pipeline::{PackagingService, SourceStores};
use hlsvault::core::config::{AppConfig, PackageBackend};
use hlsvault::core::shutdown::{ShutdownCoordinator, JOB_DRAIN_TIMEOUT_SECS, SHUTDOWN_TIMEOUT_SECS};
use hlsvault::delivery::router::{self, AppState};
use hlsvault::observability::metrics as obs_metrics;
use hlsvault::storage::{InMemoryStore, LocalStore, StoreBackend};
use hlsvault::transcode::encoder::{probe_encoder, FfmpegEncoder};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration (layered: default.toml → {env}.toml → env vars)
    let config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    // Must be installed before any metrics are recorded.
    let metrics_handle = if config.observability.metrics_enabled {
        match obs_metrics::install_prometheus_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to install Prometheus recorder");
                return ExitCode::FAILURE;
            }
        }
    } else {
        obs_metrics::detached_prometheus_handle()
    };
    obs_metrics::describe_all_metrics();

    // Log panics with a backtrace and count them.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        obs_metrics::inc_panic_total();
        let backtrace = std::backtrace::Backtrace::force_capture();
        eprintln!("PANIC: {info}\nBacktrace:\n{backtrace}");
        default_hook(info);
    }));

    info!(version = env!("CARGO_PKG_VERSION"), "hlsvault starting");

    match run(config, metrics_handle).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    config: AppConfig,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) -> anyhow::Result<ExitCode> {
    let shutdown = ShutdownCoordinator::new();
    let start_time = Instant::now();

    // Storage backends
    let local = LocalStore::new(&config.storage.local.root_dir);
    local
        .ensure_root()
        .await
        .with_context(|| format!("preparing {}", config.storage.local.root_dir.display()))?;
    let local = Arc::new(StoreBackend::Local(local));
    let remote = build_remote(&config);
    let packages = match config.storage.package_backend {
        PackageBackend::Local => Arc::clone(&local),
        PackageBackend::Memory => {
            warn!("packages are kept in memory and are lost on exit");
            Arc::new(StoreBackend::Memory(InMemoryStore::new()))
        }
        PackageBackend::S3 => remote
            .clone()
            .context("package_backend = \"s3\" requires a [storage.s3] section")?,
    };
    info!(
        package_backend = packages.kind(),
        remote_configured = remote.is_some(),
        "storage backends ready"
    );
    let sources = SourceStores { local, remote };

    tokio::fs::create_dir_all(&config.transcode.work_dir)
        .await
        .with_context(|| format!("creating {}", config.transcode.work_dir.display()))?;

    // Catalog and packaging
    let catalog = Arc::new(StreamCatalog::new(
        Arc::clone(&packages),
        &config.catalog,
        config.transcode.rendition_ladder.clone(),
    ));
    let encoder = Arc::new(FfmpegEncoder::new(
        config.transcode.ffmpeg_path.clone(),
        Duration::from_secs(config.transcode.encode_timeout_secs),
    ));
    if !probe_encoder(encoder.program(), Duration::from_secs(5)).await {
        warn!(
            program = %encoder.program().display(),
            "encoder not runnable; packaging jobs will fail until it is installed"
        );
    }
    let packaging = Arc::new(PackagingService::new(
        encoder,
        &config.transcode,
        sources.clone(),
        Arc::clone(&packages),
        Arc::clone(&catalog),
        Arc::new(JobRegistry::with_retention(
            Duration::from_secs(config.transcode.job_retention_secs),
            config.transcode.max_retained_jobs,
        )),
        shutdown.job_token(),
    ));

    // Background tasks
    let sweeper_cancel = shutdown.token();
    let work_dir = config.transcode.work_dir.clone();
    let max_age = Duration::from_secs(config.transcode.staging_max_age_secs);
    let sweep_interval = Duration::from_secs(config.transcode.sweep_interval_secs);
    tokio::spawn(async move {
        hlsvault::storage::cleanup::run_staging_sweeper(work_dir, max_age, sweep_interval, sweeper_cancel)
            .await;
    });

    let uptime_cancel = shutdown.token();
    tokio::spawn(async move {
        obs_metrics::run_uptime_task(start_time, uptime_cancel).await;
    });

    // HTTP server
    let http_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid HTTP bind address")?;
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding {http_addr}"))?;

    let app = router::build_router(AppState {
        sources,
        packages,
        catalog,
        packaging: Arc::clone(&packaging),
        config: Arc::new(config),
        start_time,
        metrics_handle,
    });

    info!(%http_addr, "HTTP server listening");

    let shutdown_token = shutdown.token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
            })
            .await
    });

    shutdown.wait_for_signal_and_shutdown().await;

    obs_metrics::set_shutdown_in_progress(true);
    info!("initiating graceful shutdown sequence");
    let shutdown_result = tokio::time::timeout(
        Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
        graceful_shutdown(packaging, server),
    )
    .await;

    match shutdown_result {
        Ok(()) => {
            info!("graceful shutdown completed");
            Ok(ExitCode::SUCCESS)
        }
        Err(_) => {
            error!(
                "shutdown timed out after {}s, forcing exit",
                SHUTDOWN_TIMEOUT_SECS
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Remote object store, when one is configured and compiled in.
fn build_remote(config: &AppConfig) -> Option<Arc<StoreBackend>> {
    let s3 = config.storage.s3.as_ref()?;
    #[cfg(feature = "s3")]
    {
        info!(endpoint = %s3.endpoint, bucket = %s3.bucket, "remote object store configured");
        Some(Arc::new(StoreBackend::S3(hlsvault::storage::S3Store::new(s3))))
    }
    #[cfg(not(feature = "s3"))]
    {
        warn!(endpoint = %s3.endpoint, "built without the s3 feature; remote backend disabled");
        None
    }
}

/// Wait for running packaging jobs to wind down, then for the HTTP server to
/// finish in-flight requests. Jobs are already cancelled with the root token.
async fn graceful_shutdown(
    packaging: Arc<PackagingService>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
) {
    info!(
        "phase 1: draining packaging jobs ({}s timeout)",
        JOB_DRAIN_TIMEOUT_SECS
    );
    if !packaging.drain(Duration::from_secs(JOB_DRAIN_TIMEOUT_SECS)).await {
        warn!("packaging jobs still running after drain timeout");
    }

    info!("phase 2: draining HTTP server");
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }
}

fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
