use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use crate::core::config::DeliveryConfig;
use crate::core::error::{DeliveryError, StorageError};
use crate::core::types::ObjectClass;
use crate::observability::metrics as obs;
use crate::storage::{BodyReader, ContentStore, ObjectBody, ObjectMetadata};

use super::range::{resolve, unsatisfiable_content_range, RangeResolution, RangeSpec};

// ---------------------------------------------------------------------------
// Range-aware object serving
// ---------------------------------------------------------------------------

/// Serve one named object from `store`, honoring a single `Range` header.
///
/// | condition                    | response                               |
/// |------------------------------|----------------------------------------|
/// | object not found             | 404, no body                           |
/// | no Range header              | 200, full body                         |
/// | Range header not satisfiable | 416, `Content-Range: bytes */<size>`   |
/// | Range header satisfiable     | 206, exactly `length` bytes            |
///
/// `HEAD` gets the same status and headers without opening the body.
pub async fn serve_object<S: ContentStore>(
    store: &S,
    name: &str,
    method: &Method,
    request_headers: &HeaderMap,
    delivery: &DeliveryConfig,
) -> Response {
    let started = Instant::now();
    let class = ObjectClass::of(name);
    let response = resolve_and_open(store, name, method, request_headers, delivery).await;

    let status = response.status().as_u16();
    obs::inc_delivery_request(status, class.as_str());
    obs::record_delivery_request_duration(class.as_str(), started.elapsed().as_secs_f64());
    debug!(name, status, elapsed_ms = started.elapsed().as_millis() as u64, "object request");
    response
}

async fn resolve_and_open<S: ContentStore>(
    store: &S,
    name: &str,
    method: &Method,
    request_headers: &HeaderMap,
    delivery: &DeliveryConfig,
) -> Response {
    let metadata = match store.stat(name).await {
        Ok(metadata) => metadata,
        Err(e) => return storage_failure(name, e),
    };

    // A Range header that is not valid text cannot be a valid range.
    let range_header = request_headers
        .get(header::RANGE)
        .map(|v| v.to_str().unwrap_or_default());

    let range = match resolve(range_header, metadata.size_bytes) {
        RangeResolution::NoRange => None,
        RangeResolution::Satisfiable(range) => Some(range),
        RangeResolution::Invalid => {
            debug!(name, header = ?range_header, size = metadata.size_bytes, "unsatisfiable range");
            return range_not_satisfiable(metadata.size_bytes);
        }
    };

    if method == Method::HEAD {
        let length = range.map(|r| r.length()).unwrap_or(metadata.size_bytes);
        return object_response(&metadata, range, length, Body::empty(), delivery);
    }

    let opened = match range {
        Some(range) => store.open_range(name, range.start(), range.end()).await,
        None => store.open_full(name).await,
    };
    let ObjectBody {
        metadata,
        length,
        reader,
    } = match opened {
        Ok(body) => body,
        Err(e) => return storage_failure(name, e),
    };

    let guard = TransferGuard::new(name, reader, length);
    let body = Body::from_stream(ReaderStream::new(guard));
    object_response(&metadata, range, length, body, delivery)
}

fn object_response(
    metadata: &ObjectMetadata,
    range: Option<RangeSpec>,
    length: u64,
    body: Body,
    delivery: &DeliveryConfig,
) -> Response {
    let mut response = Response::new(body);
    match range {
        Some(range) => {
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            obs::inc_delivery_response("partial");
            insert_header(
                response.headers_mut(),
                header::CONTENT_RANGE,
                &range.content_range(metadata.size_bytes),
            );
        }
        None => obs::inc_delivery_response("full"),
    }

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    let content_type = HeaderValue::from_str(&metadata.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    insert_header(
        headers,
        header::CACHE_CONTROL,
        cache_control_for(ObjectClass::of(&metadata.name), delivery),
    );
    insert_header(headers, header::LAST_MODIFIED, &http_date(metadata.last_modified));
    if !metadata.etag.is_empty() {
        insert_header(headers, header::ETAG, &metadata.etag);
    }
    response
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, value, "dropping invalid header value"),
    }
}

fn range_not_satisfiable(size: u64) -> Response {
    obs::inc_delivery_response("unsatisfiable");
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        [
            (header::CONTENT_RANGE, unsatisfiable_content_range(size)),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
    )
        .into_response()
}

/// Map a failed stat/open onto the decision table. Not-found is an empty 404.
fn storage_failure(name: &str, err: StorageError) -> Response {
    match err {
        StorageError::NotFound { .. } => StatusCode::NOT_FOUND.into_response(),
        StorageError::RangeNotSatisfiable { size, .. } => range_not_satisfiable(size),
        other => {
            let err = DeliveryError::from(other);
            if err.status_code() >= 500 {
                error!(name, error = %err, "storage error serving object");
            }
            err.into_response()
        }
    }
}

/// `Cache-Control` value for an object class.
pub fn cache_control_for(class: ObjectClass, delivery: &DeliveryConfig) -> &str {
    match class {
        ObjectClass::Playlist => &delivery.cache_control_playlist,
        ObjectClass::Segment => &delivery.cache_control_segment,
        ObjectClass::Video | ObjectClass::Other => &delivery.cache_control_video,
    }
}

/// RFC 7231 IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

// ---------------------------------------------------------------------------
// Transfer guard
// ---------------------------------------------------------------------------

/// Reader handed to the response body. Yields at most `expected` bytes and
/// turns an early end of stream into `UnexpectedEof`, so hyper aborts the
/// connection rather than finishing a response shorter than its
/// `Content-Length`. Transfer totals are recorded on drop.
pub struct TransferGuard {
    name: String,
    inner: Take<BodyReader>,
    expected: u64,
    sent: u64,
}

impl TransferGuard {
    pub fn new(name: &str, reader: BodyReader, expected: u64) -> Self {
        Self {
            name: name.to_string(),
            inner: reader.take(expected),
            expected,
            sent: 0,
        }
    }
}

impl AsyncRead for TransferGuard {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.sent >= this.expected || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                if n == 0 {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "{} ended after {} of {} bytes",
                            this.name, this.sent, this.expected
                        ),
                    )));
                }
                this.sent += n;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        obs::add_delivery_bytes_sent(self.sent);
        if self.sent < self.expected {
            obs::inc_delivery_aborted_transfer();
            warn!(
                name = %self.name,
                sent = self.sent,
                expected = self.expected,
                "transfer ended early"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use bytes::Bytes;
    use http_body_util::BodyExt;

    async fn store_with_thousand_bytes() -> InMemoryStore {
        let store = InMemoryStore::new();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        store
            .put("clip.mp4", Bytes::from(data), "video/mp4")
            .await
            .unwrap();
        store
    }

    fn range(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(value).unwrap());
        headers
    }

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_full_response() {
        let store = store_with_thousand_bytes().await;
        let delivery = DeliveryConfig::default();
        let response = serve_object(&store, "clip.mp4", &Method::GET, &HeaderMap::new(), &delivery).await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[header::CONTENT_LENGTH], "1000");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[header::CACHE_CONTROL], delivery.cache_control_video.as_str());
        assert!(headers.contains_key(header::ETAG));
        assert!(headers[header::LAST_MODIFIED].to_str().unwrap().ends_with(" GMT"));
        assert_eq!(body_bytes(response).await.len(), 1000);
    }

    #[tokio::test]
    async fn test_partial_response_is_exact() {
        let store = store_with_thousand_bytes().await;
        let response = serve_object(
            &store,
            "clip.mp4",
            &Method::GET,
            &range("bytes=0-499"),
            &DeliveryConfig::default(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-499/1000");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "500");
        let body = body_bytes(response).await;
        assert_eq!(body.len(), 500);
        assert_eq!(body[499], (499 % 251) as u8);
    }

    #[tokio::test]
    async fn test_open_ended_range() {
        let store = store_with_thousand_bytes().await;
        let response = serve_object(
            &store,
            "clip.mp4",
            &Method::GET,
            &range("bytes=990-"),
            &DeliveryConfig::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 990-999/1000");
        assert_eq!(body_bytes(response).await.len(), 10);
    }

    #[tokio::test]
    async fn test_unsatisfiable_ranges() {
        let store = store_with_thousand_bytes().await;
        for value in ["bytes=999-2000", "bytes=1000-", "bytes=5-1", "bytes=-500", "bytes=0-1,5-9", "items=0-1"] {
            let response = serve_object(
                &store,
                "clip.mp4",
                &Method::GET,
                &range(value),
                &DeliveryConfig::default(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{value}");
            assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
            assert!(body_bytes(response).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_object_is_empty_404() {
        let store = InMemoryStore::new();
        let response = serve_object(
            &store,
            "nope.mp4",
            &Method::GET,
            &range("bytes=0-1"),
            &DeliveryConfig::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_head_has_headers_without_body() {
        let store = store_with_thousand_bytes().await;
        let response = serve_object(
            &store,
            "clip.mp4",
            &Method::HEAD,
            &range("bytes=100-199"),
            &DeliveryConfig::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "100");
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_control_per_class() {
        let store = InMemoryStore::new();
        store
            .put("s/720p/segment_000.ts", Bytes::from_static(b"ts"), "video/mp2t")
            .await
            .unwrap();
        store
            .put("s/master.m3u8", Bytes::from_static(b"#EXTM3U\n"), "application/vnd.apple.mpegurl")
            .await
            .unwrap();
        let delivery = DeliveryConfig::default();

        let segment = serve_object(&store, "s/720p/segment_000.ts", &Method::GET, &HeaderMap::new(), &delivery).await;
        assert_eq!(segment.headers()[header::CACHE_CONTROL], delivery.cache_control_segment.as_str());
        assert_eq!(segment.headers()[header::CONTENT_TYPE], "video/mp2t");

        let master = serve_object(&store, "s/master.m3u8", &Method::GET, &HeaderMap::new(), &delivery).await;
        assert_eq!(master.headers()[header::CACHE_CONTROL], delivery.cache_control_playlist.as_str());
    }

    #[tokio::test]
    async fn test_guard_reports_short_stream() {
        let reader: BodyReader = Box::pin(std::io::Cursor::new(vec![1u8; 10]));
        let mut guard = TransferGuard::new("short.ts", reader, 20);
        let mut out = Vec::new();
        let err = guard.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert_eq!(out.len(), 10);
    }

    #[tokio::test]
    async fn test_guard_caps_long_stream() {
        let reader: BodyReader = Box::pin(std::io::Cursor::new(vec![1u8; 50]));
        let mut guard = TransferGuard::new("long.ts", reader, 20);
        let mut out = Vec::new();
        guard.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 20);
    }

    #[test]
    fn test_http_date() {
        let t = DateTime::parse_from_rfc3339("1994-11-06T08:49:37Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(http_date(t), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
