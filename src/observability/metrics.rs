use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// ---------------------------------------------------------------------------
// Metrics catalog
// ---------------------------------------------------------------------------

/// Register all metric descriptors at startup.
///
/// Call once, after the recorder is installed and before any metric is
/// recorded.
pub fn describe_all_metrics() {
    // -- Delivery --
    describe_counter!(
        "hlsvault_delivery_requests_total",
        "Object requests by status class and object class"
    );
    describe_histogram!(
        "hlsvault_delivery_request_duration_seconds",
        "Time to resolve an object request up to the response headers"
    );
    describe_counter!(
        "hlsvault_delivery_bytes_sent_total",
        "Body bytes streamed to clients"
    );
    describe_counter!(
        "hlsvault_delivery_responses_total",
        "Object responses by kind (full, partial, unsatisfiable)"
    );
    describe_counter!(
        "hlsvault_delivery_aborted_transfers_total",
        "Bodies cut short after headers were sent"
    );
    describe_counter!("hlsvault_upload_bytes_total", "Bytes accepted by uploads");

    // -- Storage --
    describe_histogram!(
        "hlsvault_storage_operation_duration_seconds",
        "Storage backend operation latency"
    );
    describe_counter!(
        "hlsvault_storage_errors_total",
        "Storage operation failures other than not-found"
    );
    describe_counter!(
        "hlsvault_storage_retries_total",
        "Object store write retries"
    );
    describe_counter!(
        "hlsvault_staging_swept_total",
        "Stale staging entries removed by the sweeper"
    );

    // -- Catalog --
    describe_counter!("hlsvault_catalog_cache_hits_total", "Catalog cache hits");
    describe_counter!("hlsvault_catalog_cache_misses_total", "Catalog cache misses");

    // -- Transcode --
    describe_gauge!(
        "hlsvault_transcode_active_jobs",
        "Packaging jobs currently encoding"
    );
    describe_counter!(
        "hlsvault_transcode_jobs_total",
        "Finished transcode runs by result"
    );
    describe_histogram!(
        "hlsvault_rendition_encode_duration_seconds",
        "Wall time of one rendition encode"
    );
    describe_gauge!("hlsvault_jobs", "Packaging jobs by state");

    // -- System --
    describe_gauge!("hlsvault_uptime_seconds", "Process uptime");
    describe_counter!(
        "hlsvault_panic_total",
        "Total panics caught (should always be 0)"
    );
    describe_gauge!(
        "hlsvault_shutdown_in_progress",
        "1 if graceful shutdown is in progress, 0 otherwise"
    );
}

// ---------------------------------------------------------------------------
// Metric recording helpers
// ---------------------------------------------------------------------------

// -- Delivery --

pub fn inc_delivery_request(status: u16, object_class: &'static str) {
    counter!(
        "hlsvault_delivery_requests_total",
        "status" => status_class(status),
        "object_class" => object_class
    )
    .increment(1);
}

pub fn record_delivery_request_duration(object_class: &'static str, seconds: f64) {
    histogram!("hlsvault_delivery_request_duration_seconds", "object_class" => object_class)
        .record(seconds);
}

pub fn add_delivery_bytes_sent(bytes: u64) {
    counter!("hlsvault_delivery_bytes_sent_total").increment(bytes);
}

/// `kind` is one of `full`, `partial`, `unsatisfiable`.
pub fn inc_delivery_response(kind: &'static str) {
    counter!("hlsvault_delivery_responses_total", "kind" => kind).increment(1);
}

pub fn inc_delivery_aborted_transfer() {
    counter!("hlsvault_delivery_aborted_transfers_total").increment(1);
}

pub fn add_upload_bytes(backend: &'static str, bytes: u64) {
    counter!("hlsvault_upload_bytes_total", "backend" => backend).increment(bytes);
}

// -- Storage --

pub fn record_storage_operation(backend: &'static str, operation: &'static str, seconds: f64) {
    histogram!(
        "hlsvault_storage_operation_duration_seconds",
        "backend" => backend,
        "operation" => operation
    )
    .record(seconds);
}

pub fn inc_storage_error(backend: &'static str, operation: &'static str, error_type: &'static str) {
    counter!(
        "hlsvault_storage_errors_total",
        "backend" => backend,
        "operation" => operation,
        "error_type" => error_type
    )
    .increment(1);
}

pub fn inc_storage_retries(operation: &'static str) {
    counter!("hlsvault_storage_retries_total", "operation" => operation).increment(1);
}

pub fn inc_staging_swept(count: u64) {
    counter!("hlsvault_staging_swept_total").increment(count);
}

// -- Catalog --

pub fn record_catalog_cache(cache: &'static str, hit: bool) {
    if hit {
        counter!("hlsvault_catalog_cache_hits_total", "cache" => cache).increment(1);
    } else {
        counter!("hlsvault_catalog_cache_misses_total", "cache" => cache).increment(1);
    }
}

// -- Transcode --

pub fn inc_transcode_active_jobs() {
    gauge!("hlsvault_transcode_active_jobs").increment(1.0);
}

pub fn dec_transcode_active_jobs() {
    gauge!("hlsvault_transcode_active_jobs").decrement(1.0);
}

/// `result` is one of `completed`, `failed`, `cancelled`.
pub fn inc_transcode_jobs(result: &'static str) {
    counter!("hlsvault_transcode_jobs_total", "result" => result).increment(1);
}

pub fn record_rendition_encode_duration(rendition: &str, seconds: f64) {
    histogram!("hlsvault_rendition_encode_duration_seconds", "rendition" => rendition.to_string())
        .record(seconds);
}

pub fn set_jobs_by_state(state: &'static str, count: f64) {
    gauge!("hlsvault_jobs", "state" => state).set(count);
}

// -- System --

pub fn set_uptime_seconds(seconds: f64) {
    gauge!("hlsvault_uptime_seconds").set(seconds);
}

pub fn inc_panic_total() {
    counter!("hlsvault_panic_total").increment(1);
}

pub fn set_shutdown_in_progress(in_progress: bool) {
    gauge!("hlsvault_shutdown_in_progress").set(if in_progress { 1.0 } else { 0.0 });
}

// ---------------------------------------------------------------------------
// Label helpers
// ---------------------------------------------------------------------------

/// Bucket an HTTP status into its class label.
pub fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

// ---------------------------------------------------------------------------
// Uptime tracking task
// ---------------------------------------------------------------------------

/// Update the uptime gauge every second until cancelled.
pub async fn run_uptime_task(start_time: Instant, cancel: tokio_util::sync::CancellationToken) {
    let interval = std::time::Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                set_uptime_seconds(start_time.elapsed().as_secs_f64());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prometheus recorder installation
// ---------------------------------------------------------------------------

/// Install the global Prometheus recorder. The returned handle renders the
/// text exposition format for `GET /metrics`.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// A handle backed by a recorder that is not installed globally, for
/// routers built in tests or with metrics disabled.
pub fn detached_prometheus_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(200), "2xx");
        assert_eq!(status_class(206), "2xx");
        assert_eq!(status_class(304), "3xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(416), "4xx");
        assert_eq!(status_class(503), "5xx");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        inc_delivery_request(206, "segment");
        record_catalog_cache("streams", true);
        set_jobs_by_state("queued", 1.0);
    }

    #[test]
    fn test_detached_handle_renders() {
        let handle = detached_prometheus_handle();
        let _ = handle.render();
    }
}
