//! Document handles and extraction result types.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ErrorDetail;
use crate::store::Locator;

/// Input document: a stored object or an in-memory buffer. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentRef {
    /// Hosted backends receive the locator. `fetched` holds the object's bytes
    /// when the caller already read them, so local backends skip the store.
    Stored {
        locator: Locator,
        fetched: Option<Arc<[u8]>>,
    },
    Bytes { name: String, data: Arc<[u8]> },
}

impl DocumentRef {
    pub fn stored(locator: Locator) -> Self {
        Self::Stored {
            locator,
            fetched: None,
        }
    }

    /// A stored object whose bytes are already in memory.
    pub fn fetched(locator: Locator, data: Vec<u8>) -> Self {
        Self::Stored {
            locator,
            fetched: Some(data.into()),
        }
    }

    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Human-readable name for logs.
    pub fn display_name(&self) -> String {
        match self {
            Self::Stored { locator, .. } => locator.to_string(),
            Self::Bytes { name, data } => format!("{} ({} bytes)", name, data.len()),
        }
    }
}

/// Identifies one extraction technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    HostedSync,
    HostedAsync,
    NativeText,
    LocalOcr,
}

impl BackendId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostedSync => "hosted_sync",
            Self::HostedAsync => "hosted_async",
            Self::NativeText => "native_text",
            Self::LocalOcr => "local_ocr",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text produced by a successful extraction chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedText {
    pub content: String,
    pub source_backend: BackendId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    pub truncated: bool,
}

impl ExtractedText {
    pub fn new(content: String, source_backend: BackendId) -> Self {
        Self {
            content,
            source_backend,
            page_count: None,
            truncated: false,
        }
    }

    pub fn with_pages(mut self, page_count: Option<u32>) -> Self {
        self.page_count = page_count;
        self
    }

    /// Cut content to at most `max_chars` characters, flagging the cut.
    pub fn truncate_to(mut self, max_chars: usize) -> Self {
        if let Some((byte_idx, _)) = self.content.char_indices().nth(max_chars) {
            self.content.truncate(byte_idx);
            self.truncated = true;
        }
        self
    }
}

/// How one backend attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Retryable,
    Fatal,
    LowQuality,
    TooLarge,
}

/// Log record for one backend within a single orchestration run. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionAttempt {
    pub backend: BackendId,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}
