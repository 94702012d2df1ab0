use thiserror::Error;

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors originating from a content-store backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {name}")]
    NotFound { name: String },

    #[error("invalid object name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("object already exists: {name}")]
    AlreadyExists { name: String },

    /// The requested byte range does not fit the object's current size.
    #[error("range not satisfiable for {name} (size {size})")]
    RangeNotSatisfiable { name: String, size: u64 },

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("invalid request: {reason}")]
    InvalidInput { reason: String },

    #[error("{operation} failed for {name}: {reason}")]
    Backend {
        operation: &'static str,
        name: String,
        reason: String,
    },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::NotFound { .. } => "not_found",
            StorageError::InvalidName { .. } => "invalid_name",
            StorageError::AlreadyExists { .. } => "already_exists",
            StorageError::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            StorageError::Unsupported { .. } => "unsupported",
            StorageError::InvalidInput { .. } => "invalid_input",
            StorageError::Backend { .. } => "backend",
            StorageError::Io(_) => "io",
        }
    }
}

// ---------------------------------------------------------------------------
// Transcode errors
// ---------------------------------------------------------------------------

/// Errors originating from the transcoding orchestrator and encoders.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("invalid transcode input: {reason}")]
    InvalidInput { reason: String },

    #[error("failed to start encoder: {reason}")]
    Spawn { reason: String },

    #[error("rendition {rendition} failed: {reason}")]
    RenditionFailed { rendition: String, reason: String },

    #[error("rendition {rendition} timed out after {timeout_secs}s")]
    Timeout { rendition: String, timeout_secs: u64 },

    #[error("packaging of {stream_name} was cancelled")]
    Cancelled { stream_name: String },

    #[error("publishing {stream_name} failed: {source}")]
    Publish {
        stream_name: String,
        #[source]
        source: StorageError,
    },

    #[error("transcode I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Catalog errors
// ---------------------------------------------------------------------------

/// Errors originating from the stream catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("stream not found: {name}")]
    NotFound { name: String },

    #[error("invalid stream name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("catalog storage error: {0}")]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Job errors
// ---------------------------------------------------------------------------

/// Errors related to packaging job bookkeeping.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job transition from {from} to {to} for job {job_id}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("job not found: {job_id}")]
    NotFound { job_id: String },
}

// ---------------------------------------------------------------------------
// Packaging errors
// ---------------------------------------------------------------------------

/// Errors rejecting a packaging request before its job is queued.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("invalid packaging request: {reason}")]
    InvalidInput { reason: String },

    #[error("source not found: {name}")]
    SourceNotFound { name: String },

    #[error("stream {name} already exists or is being packaged")]
    Conflict { name: String },

    #[error("{reason}")]
    Unavailable { reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Delivery errors
// ---------------------------------------------------------------------------

/// Errors surfaced by HTTP handlers, each mapped to one status code.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("range not satisfiable: {reason}")]
    InvalidRange { reason: String },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("storage backend error: {reason}")]
    Backend { reason: String },

    #[error("service unavailable: {reason}")]
    Unavailable { reason: String },
}

impl DeliveryError {
    /// Map a DeliveryError to its HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            DeliveryError::NotFound { .. } => 404,
            DeliveryError::InvalidRange { .. } => 416,
            DeliveryError::InvalidInput { .. } => 400,
            DeliveryError::Conflict { .. } => 409,
            DeliveryError::Backend { .. } => 500,
            DeliveryError::Unavailable { .. } => 503,
        }
    }

    /// Return the error code string for JSON responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            DeliveryError::NotFound { .. } => "not_found",
            DeliveryError::InvalidRange { .. } => "range_not_satisfiable",
            DeliveryError::InvalidInput { .. } => "invalid_input",
            DeliveryError::Conflict { .. } => "conflict",
            DeliveryError::Backend { .. } => "storage_error",
            DeliveryError::Unavailable { .. } => "backend_unavailable",
        }
    }
}

impl From<StorageError> for DeliveryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { name } => DeliveryError::NotFound { what: name },
            StorageError::InvalidName { .. } | StorageError::InvalidInput { .. } => {
                DeliveryError::InvalidInput {
                    reason: err.to_string(),
                }
            }
            StorageError::AlreadyExists { .. } => DeliveryError::Conflict {
                reason: err.to_string(),
            },
            StorageError::RangeNotSatisfiable { .. } => DeliveryError::InvalidRange {
                reason: err.to_string(),
            },
            StorageError::Unsupported { .. } => DeliveryError::Unavailable {
                reason: err.to_string(),
            },
            StorageError::Backend { .. } | StorageError::Io(_) => DeliveryError::Backend {
                reason: err.to_string(),
            },
        }
    }
}

impl From<CatalogError> for DeliveryError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound { name } => DeliveryError::NotFound {
                what: format!("stream {name}"),
            },
            CatalogError::InvalidName { .. } => DeliveryError::InvalidInput {
                reason: err.to_string(),
            },
            CatalogError::Storage(inner) => inner.into(),
        }
    }
}

impl From<PackagingError> for DeliveryError {
    fn from(err: PackagingError) -> Self {
        match err {
            PackagingError::InvalidInput { .. } => DeliveryError::InvalidInput {
                reason: err.to_string(),
            },
            PackagingError::SourceNotFound { name } => DeliveryError::NotFound {
                what: format!("source {name}"),
            },
            PackagingError::Conflict { .. } => DeliveryError::Conflict {
                reason: err.to_string(),
            },
            PackagingError::Unavailable { reason } => DeliveryError::Unavailable { reason },
            PackagingError::Storage(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_status_codes() {
        let cases: Vec<(StorageError, u16)> = vec![
            (StorageError::NotFound { name: "a".into() }, 404),
            (
                StorageError::InvalidName {
                    name: "../a".into(),
                    reason: "escapes root".into(),
                },
                400,
            ),
            (
                StorageError::RangeNotSatisfiable {
                    name: "a".into(),
                    size: 10,
                },
                416,
            ),
            (
                StorageError::Backend {
                    operation: "get",
                    name: "a".into(),
                    reason: "timeout".into(),
                },
                500,
            ),
            (
                StorageError::Unsupported {
                    backend: "local",
                    operation: "presign",
                },
                503,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(DeliveryError::from(err).status_code(), status);
        }
    }

    #[test]
    fn catalog_not_found_is_404() {
        let err: DeliveryError = CatalogError::NotFound { name: "x".into() }.into();
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.error_code(), "not_found");
    }
}
