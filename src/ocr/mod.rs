//! Text extraction backends.
//!
//! Each extraction technology is one variant of [`Backend`]. Hosted variants
//! talk to a [`DetectionService`]; local variants read document bytes through
//! the blob store. All of them report failures as [`BackendError`].

pub mod hosted;
pub mod hosted_async;
pub mod hosted_sync;
pub mod local_tool;
pub mod native;
pub mod poller;

#[cfg(test)]
pub mod mock;

use serde::{Deserialize, Serialize};

use crate::document::{BackendId, DocumentRef, ExtractedText};
use crate::error::BackendError;

pub use hosted::HttpDetectionClient;
pub use hosted_async::HostedAsyncOcr;
pub use hosted_sync::HostedSyncOcr;
pub use local_tool::LocalOcrTool;
pub use native::NativeTextLayer;

/// Kind of a detected block. Only lines carry text we keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockType {
    Page,
    Line,
    Word,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_type: BlockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[cfg(test)]
impl Block {
    pub fn line(text: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Line,
            text: Some(text.into()),
        }
    }

    pub fn page() -> Self {
        Self {
            block_type: BlockType::Page,
            text: None,
        }
    }
}

/// Synchronous detection/analysis response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
}

/// Richer synchronous analysis modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisFeature {
    Tables,
    Forms,
}

/// Status of an asynchronous detection job as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Succeeded,
    PartialSuccess,
    Failed,
}

/// One response of a job query: status plus one page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub job_status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
}

/// Hosted OCR/detection service contract.
#[async_trait::async_trait]
pub trait DetectionService: Send + Sync {
    async fn detect(&self, doc: &DocumentRef) -> Result<DetectResponse, BackendError>;
    async fn analyze(
        &self,
        doc: &DocumentRef,
        features: &[AnalysisFeature],
    ) -> Result<DetectResponse, BackendError>;
    /// Start an asynchronous job; returns its id.
    async fn submit(&self, doc: &DocumentRef) -> Result<String, BackendError>;
    async fn poll(&self, job_id: &str, next_token: Option<&str>) -> Result<JobPage, BackendError>;
}

/// Concatenate the text of every LINE block, one per line, in block order.
pub fn collect_lines<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> String {
    let mut text = String::new();
    for block in blocks {
        if block.block_type == BlockType::Line {
            if let Some(line) = &block.text {
                text.push_str(line);
                text.push('\n');
            }
        }
    }
    text
}

/// Page count from explicit metadata, else from PAGE blocks.
pub fn count_pages<'a>(reported: Option<u32>, blocks: impl IntoIterator<Item = &'a Block>) -> Option<u32> {
    reported.or_else(|| {
        let pages = blocks
            .into_iter()
            .filter(|b| b.block_type == BlockType::Page)
            .count() as u32;
        (pages > 0).then_some(pages)
    })
}

/// One configured extraction technology.
pub enum Backend {
    HostedSync(HostedSyncOcr),
    HostedAsync(HostedAsyncOcr),
    NativeText(NativeTextLayer),
    LocalOcr(LocalOcrTool),
}

impl Backend {
    pub fn id(&self) -> BackendId {
        match self {
            Self::HostedSync(_) => BackendId::HostedSync,
            Self::HostedAsync(_) => BackendId::HostedAsync,
            Self::NativeText(_) => BackendId::NativeText,
            Self::LocalOcr(_) => BackendId::LocalOcr,
        }
    }

    /// Hosted backends retry each service call themselves.
    pub fn retries_service_calls(&self) -> bool {
        matches!(self, Self::HostedSync(_) | Self::HostedAsync(_))
    }

    pub async fn extract(&self, doc: &DocumentRef) -> Result<ExtractedText, BackendError> {
        match self {
            Self::HostedSync(b) => b.extract(doc).await,
            Self::HostedAsync(b) => b.extract(doc).await,
            Self::NativeText(b) => b.extract(doc).await,
            Self::LocalOcr(b) => b.extract(doc).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_lines_skips_words_and_pages() {
        let blocks = vec![
            Block::page(),
            Block::line("Report on Controls"),
            Block {
                block_type: BlockType::Word,
                text: Some("Report".into()),
            },
            Block::line("Section 1"),
        ];
        assert_eq!(collect_lines(&blocks), "Report on Controls\nSection 1\n");
        assert_eq!(count_pages(None, &blocks), Some(1));
        assert_eq!(count_pages(Some(7), &blocks), Some(7));
    }

    #[test]
    fn test_wire_format() {
        let page: JobPage = serde_json::from_str(
            r#"{"job_status":"SUCCEEDED","blocks":[{"block_type":"LINE","text":"a"},{"block_type":"KEY_VALUE_SET"}],"next_token":"t1"}"#,
        )
        .unwrap();
        assert_eq!(page.job_status, JobStatus::Succeeded);
        assert_eq!(page.blocks[1].block_type, BlockType::Other);
        assert_eq!(page.next_token.as_deref(), Some("t1"));
    }
}
