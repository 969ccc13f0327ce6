//! Error taxonomy for the capture pipeline.

use thiserror::Error;

use crate::bridges::SourceError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub(crate) enum CaptureError {
    /// Storage I/O or timeout. Nothing was persisted; retry on the next trigger.
    #[error("transient storage failure: {0}")]
    TransientIo(#[from] StoreError),

    /// The update source could not be reached or answered garbage.
    #[error("update source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    /// A single inbound update could not be understood.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Cursor regression or an unguarded duplicate insert.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The stored archive exists but cannot be decoded. Overwriting it would
    /// lose data, so the cycle stops here.
    #[error("stored archive {key} is unreadable: {source}")]
    CorruptArchive {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("capture worker is no longer running")]
    WorkerGone,
}

impl CaptureError {
    /// Whether the loop may keep going and retry after a backoff.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::TransientIo(_) | CaptureError::SourceUnavailable(_)
        )
    }
}

pub(crate) type CaptureResult<T> = Result<T, CaptureError>;
