//! Error taxonomy for text extraction and the surrounding pipeline.
//!
//! Backends classify every failure as [`BackendError`]; the orchestrator uses
//! that classification to decide between retrying, falling back to the next
//! backend, or redirecting a large document to the async backend.

use std::fmt;

use axum::http::StatusCode;
use serde::Serialize;

use crate::document::{AttemptOutcome, BackendId};

/// Code and message exactly as reported by the failing backend or service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Failure of a single backend invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Transient (throttling, throughput limits, timeouts); retried with backoff.
    #[error("transient error ({0})")]
    Retryable(ErrorDetail),
    /// Permanent for this backend; the chain moves on without retrying.
    #[error("permanent error ({0})")]
    Fatal(ErrorDetail),
    /// The backend ran but produced nothing usable.
    #[error("unusable output: {0}")]
    LowQuality(String),
    /// Document exceeds what this backend accepts; redirect to the async backend.
    #[error("document too large ({0})")]
    TooLarge(ErrorDetail),
}

impl BackendError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retryable(ErrorDetail::new(code, message))
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal(ErrorDetail::new(code, message))
    }

    pub fn too_large(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TooLarge(ErrorDetail::new(code, message))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Retryable(_) => AttemptOutcome::Retryable,
            Self::Fatal(_) => AttemptOutcome::Fatal,
            Self::LowQuality(_) => AttemptOutcome::LowQuality,
            Self::TooLarge(_) => AttemptOutcome::TooLarge,
        }
    }

    /// Detail suitable for attempt logs. Low-quality results carry no service code.
    pub fn detail(&self) -> ErrorDetail {
        match self {
            Self::Retryable(d) | Self::Fatal(d) | Self::TooLarge(d) => d.clone(),
            Self::LowQuality(reason) => ErrorDetail::new("LowQuality", reason.clone()),
        }
    }
}

/// Terminal failure of a whole extraction run.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("no extraction backends are configured")]
    NoBackends,
    #[error("all extraction backends failed after {attempts} attempts; last backend {backend}: {source}")]
    AllFailed {
        backend: BackendId,
        attempts: usize,
        #[source]
        source: BackendError,
    },
}

/// Blob store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object locator: {0}")]
    InvalidLocator(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => BackendError::fatal("NoSuchKey", path),
            StoreError::InvalidLocator(path) => BackendError::fatal("InvalidObject", path),
            StoreError::Io(e) => match e.kind() {
                std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock => BackendError::retryable("StorageIo", e.to_string()),
                std::io::ErrorKind::PermissionDenied => {
                    BackendError::fatal("AccessDenied", e.to_string())
                }
                _ => BackendError::fatal("StorageIo", e.to_string()),
            },
        }
    }
}

/// Chat-completion call failures.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("LLM request failed: {message}")]
    Transport { message: String, retryable: bool },
    #[error("LLM response could not be decoded: {0}")]
    Decode(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Transport { retryable, .. } => *retryable,
            Self::Decode(_) => false,
        }
    }
}

/// Failure of the end-to-end report pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Bad event or bad input document; the caller sent something unusable.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("document not found: {0}")]
    NotFound(String),
    /// Every extraction backend failed; a processing failure, not a validation one.
    #[error("text extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("{stage} stage failed: {source:#}")]
    Stage {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn stage(stage: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Stage {
            stage,
            source: source.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Stage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound(_) => "ResourceNotFoundError",
            Self::Extraction(_) => "ExtractionError",
            Self::Stage { .. } => "InternalServerError",
        }
    }
}
