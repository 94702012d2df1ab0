use std::time::Duration;

use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::{GetObjectError, GetObjectOutput};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::config::S3Config;
use crate::core::error::StorageError;
use crate::observability::metrics as obs;

use super::{content_type_for_path, ContentStore, ObjectBody, ObjectMetadata};

// ---------------------------------------------------------------------------
// Retry constants (writes only; reads are never retried here)
// ---------------------------------------------------------------------------

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

/// `DeleteObjects` accepts at most this many keys per request.
const MAX_DELETE_BATCH: usize = 1000;

// ---------------------------------------------------------------------------
// S3Store
// ---------------------------------------------------------------------------

/// Remote object-store backend wrapping `aws-sdk-s3`.
///
/// Supports AWS S3 and S3-compatible stores (MinIO, Spaces, ...) via a
/// configurable endpoint and path-style addressing. Names are opaque keys.
pub struct S3Store {
    client: Client,
    bucket: String,
    max_presign_expiry: Duration,
}

impl S3Store {
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "hlsvault-config",
        );

        let timeouts = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.request_timeout_secs))
            .build();

        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.path_style)
            .timeout_config(timeouts);

        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(&config.endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            max_presign_expiry: Duration::from_secs(config.max_presign_expiry_secs),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Time-limited GET URL. Expiries above the configured cap are rejected.
    pub async fn presign_get(&self, name: &str, expires: Duration) -> Result<String, StorageError> {
        if expires > self.max_presign_expiry {
            return Err(StorageError::InvalidInput {
                reason: format!(
                    "expiry {}s exceeds maximum {}s",
                    expires.as_secs(),
                    self.max_presign_expiry.as_secs()
                ),
            });
        }
        let presign_config =
            PresigningConfig::expires_in(expires).map_err(|e| StorageError::InvalidInput {
                reason: e.to_string(),
            })?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .presigned(presign_config)
            .await
            .map_err(|e| backend_error("presign", name, &e))?;
        Ok(request.uri().to_string())
    }

    /// PUT with exponential backoff. Client errors (4xx) are not retried.
    async fn put_with_retry(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let mut last_err = String::new();

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * (1 << (attempt - 1)));
                debug!(
                    key,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying S3 PUT"
                );
                obs::inc_storage_retries("put");
                tokio::time::sleep(backoff).await;
            }

            match self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(body.clone()))
                .content_type(content_type)
                .send()
                .await
            {
                Ok(output) => return Ok(output.e_tag.unwrap_or_default()),
                Err(e) => {
                    let client_error = matches!(
                        &e,
                        SdkError::ServiceError(ctx) if ctx.raw().status().is_client_error()
                    );
                    let reason = DisplayErrorContext(&e).to_string();
                    if client_error {
                        return Err(StorageError::Backend {
                            operation: "put",
                            name: key.to_string(),
                            reason,
                        });
                    }
                    warn!(key, attempt, error = %reason, "S3 PUT failed");
                    last_err = reason;
                }
            }
        }

        Err(StorageError::Backend {
            operation: "put",
            name: key.to_string(),
            reason: format!("retries exhausted: {}", last_err),
        })
    }

    async fn get(&self, name: &str, range: Option<(u64, u64)>) -> Result<GetObjectOutput, GetFailure> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(name);
        if let Some((start, end)) = range {
            request = request.range(format!("bytes={}-{}", start, end));
        }
        request.send().await.map_err(|e| classify_get_error(name, e))
    }
}

/// Outcome of a failed GetObject, before a size lookup for range failures.
enum GetFailure {
    Storage(StorageError),
    InvalidRange,
}

fn classify_get_error(name: &str, err: SdkError<GetObjectError>) -> GetFailure {
    if let SdkError::ServiceError(ctx) = &err {
        let status = ctx.raw().status().as_u16();
        if ctx.err().is_no_such_key() || status == 404 {
            return GetFailure::Storage(StorageError::NotFound {
                name: name.to_string(),
            });
        }
        if ctx.err().code() == Some("InvalidRange") || status == 416 {
            return GetFailure::InvalidRange;
        }
    }
    GetFailure::Storage(backend_error("get", name, &err))
}

fn backend_error<E>(operation: &'static str, name: &str, err: &E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::Backend {
        operation,
        name: name.to_string(),
        reason: DisplayErrorContext(err).to_string(),
    }
}

fn to_chrono(t: Option<&SmithyDateTime>) -> DateTime<Utc> {
    t.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

/// Total object size from a `Content-Range: bytes a-b/total` header.
fn content_range_total(header: Option<&str>) -> Option<u64> {
    header?.rsplit_once('/')?.1.trim().parse().ok()
}

fn metadata_from_get(name: &str, output: &GetObjectOutput, size_bytes: u64) -> ObjectMetadata {
    ObjectMetadata {
        name: name.to_string(),
        size_bytes,
        content_type: output
            .content_type
            .clone()
            .unwrap_or_else(|| content_type_for_path(name).to_string()),
        last_modified: to_chrono(output.last_modified.as_ref()),
        etag: output.e_tag.clone().unwrap_or_default(),
    }
}

impl ContentStore for S3Store {
    async fn stat(&self, name: &str) -> Result<ObjectMetadata, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(ctx)
                    if ctx.err().is_not_found() || ctx.raw().status().as_u16() == 404 =>
                {
                    StorageError::NotFound {
                        name: name.to_string(),
                    }
                }
                _ => backend_error("head", name, &e),
            })?;

        Ok(ObjectMetadata {
            name: name.to_string(),
            size_bytes: output.content_length.unwrap_or(0).max(0) as u64,
            content_type: output
                .content_type
                .unwrap_or_else(|| content_type_for_path(name).to_string()),
            last_modified: to_chrono(output.last_modified.as_ref()),
            etag: output.e_tag.unwrap_or_default(),
        })
    }

    async fn open_range(&self, name: &str, start: u64, end: u64) -> Result<ObjectBody, StorageError> {
        if start > end {
            let size = self.stat(name).await?.size_bytes;
            return Err(StorageError::RangeNotSatisfiable {
                name: name.to_string(),
                size,
            });
        }

        let output = match self.get(name, Some((start, end))).await {
            Ok(output) => output,
            Err(GetFailure::Storage(e)) => return Err(e),
            Err(GetFailure::InvalidRange) => {
                let size = self.stat(name).await?.size_bytes;
                return Err(StorageError::RangeNotSatisfiable {
                    name: name.to_string(),
                    size,
                });
            }
        };

        let length = end - start + 1;
        let total = content_range_total(output.content_range.as_deref()).ok_or_else(|| {
            StorageError::Backend {
                operation: "get",
                name: name.to_string(),
                reason: "range response without a Content-Range total".to_string(),
            }
        })?;
        // S3 clamps an end past the object; an exact range is required here.
        if end >= total || output.content_length.unwrap_or(-1) != length as i64 {
            return Err(StorageError::RangeNotSatisfiable {
                name: name.to_string(),
                size: total,
            });
        }

        let metadata = metadata_from_get(name, &output, total);
        Ok(ObjectBody {
            metadata,
            length,
            reader: Box::pin(output.body.into_async_read()),
        })
    }

    async fn open_full(&self, name: &str) -> Result<ObjectBody, StorageError> {
        let output = match self.get(name, None).await {
            Ok(output) => output,
            Err(GetFailure::Storage(e)) => return Err(e),
            Err(GetFailure::InvalidRange) => {
                return Err(StorageError::Backend {
                    operation: "get",
                    name: name.to_string(),
                    reason: "unexpected InvalidRange on a full read".to_string(),
                })
            }
        };
        let size = output.content_length.unwrap_or(0).max(0) as u64;
        let metadata = metadata_from_get(name, &output, size);
        Ok(ObjectBody {
            metadata,
            length: size,
            reader: Box::pin(output.body.into_async_read()),
        })
    }

    async fn put(&self, name: &str, data: Bytes, content_type: &str) -> Result<String, StorageError> {
        if name.is_empty() {
            return Err(StorageError::InvalidName {
                name: String::new(),
                reason: "name is empty".to_string(),
            });
        }
        self.put_with_retry(name, data, content_type).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMetadata>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                req = req.continuation_token(token);
            }

            let output = req
                .send()
                .await
                .map_err(|e| backend_error("list", prefix, &e))?;

            for obj in output.contents.unwrap_or_default() {
                let Some(key) = obj.key else {
                    continue;
                };
                objects.push(ObjectMetadata {
                    size_bytes: obj.size.unwrap_or(0).max(0) as u64,
                    content_type: content_type_for_path(&key).to_string(),
                    last_modified: to_chrono(obj.last_modified.as_ref()),
                    etag: obj.e_tag.unwrap_or_default(),
                    name: key,
                });
            }

            if output.is_truncated.unwrap_or(false) {
                continuation_token = output.next_continuation_token;
            } else {
                break;
            }
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        // Snapshot first so deletions do not disturb pagination.
        let objects = self.list(prefix).await?;
        let mut deleted_count: u64 = 0;
        for batch in objects.chunks(MAX_DELETE_BATCH) {
            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(build_delete(batch)?)
                .send()
                .await
                .map_err(|e| backend_error("delete", prefix, &e))?;

            let failures = output.errors();
            if let Some(first) = failures.first() {
                return Err(StorageError::Backend {
                    operation: "delete",
                    name: first.key().unwrap_or(prefix).to_string(),
                    reason: format!(
                        "{} of {} keys not deleted: {}",
                        failures.len(),
                        batch.len(),
                        first.message().or(first.code()).unwrap_or("unknown error")
                    ),
                });
            }
            deleted_count += batch.len() as u64;
        }
        debug!(%prefix, deleted_count, "S3 prefix deleted");
        Ok(deleted_count)
    }
}

/// One quiet `DeleteObjects` request body for `batch`.
fn build_delete(batch: &[ObjectMetadata]) -> Result<Delete, StorageError> {
    let invalid = |e: aws_sdk_s3::error::BuildError| StorageError::InvalidInput {
        reason: format!("delete request: {e}"),
    };
    let identifiers = batch
        .iter()
        .map(|object| ObjectIdentifier::builder().key(&object.name).build())
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid)?;
    Delete::builder()
        .set_objects(Some(identifiers))
        .quiet(true)
        .build()
        .map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> S3Config {
        S3Config {
            endpoint: "http://127.0.0.1:9".to_string(),
            bucket: "videos".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "test".to_string(),
            secret_access_key: "test".to_string(),
            path_style: true,
            request_timeout_secs: 1,
            max_presign_expiry_secs: 3600,
        }
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total(Some("bytes 0-499/1000")), Some(1000));
        assert_eq!(content_range_total(Some("bytes */1000")), Some(1000));
        assert_eq!(content_range_total(Some("bytes 0-499/*")), None);
        assert_eq!(content_range_total(None), None);
    }

    #[test]
    fn test_delete_batches_stay_within_request_limit() {
        let objects: Vec<ObjectMetadata> = (0..2500)
            .map(|i| ObjectMetadata {
                name: format!("show/720p/segment_{i:04}.ts"),
                size_bytes: 1,
                content_type: "video/mp2t".to_string(),
                last_modified: Utc::now(),
                etag: String::new(),
            })
            .collect();

        let sizes: Vec<usize> = objects
            .chunks(MAX_DELETE_BATCH)
            .map(|batch| build_delete(batch).unwrap().objects().len())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        let delete = build_delete(&objects[..1]).unwrap();
        assert_eq!(delete.objects()[0].key(), "show/720p/segment_0000.ts");
        assert_eq!(delete.quiet(), Some(true));
    }

    #[tokio::test]
    async fn test_presign_respects_cap() {
        let store = S3Store::new(&config());
        assert!(matches!(
            store.presign_get("a.mp4", Duration::from_secs(3601)).await,
            Err(StorageError::InvalidInput { .. })
        ));

        let url = store
            .presign_get("movies/a.mp4", Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9/videos/movies/a.mp4?"));
        assert!(url.contains("X-Amz-Expires=600"));
    }
}
