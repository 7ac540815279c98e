//! Hosted OCR, synchronous mode.
//!
//! One detection round trip. When detection finds no lines at all, a single
//! table/form-aware analysis call is tried before reporting low quality. Each
//! service call is retried on its own, so a throttled analysis never repeats
//! the detection that preceded it.

use std::sync::Arc;

use tracing::{info, warn};

use super::{collect_lines, count_pages, AnalysisFeature, DetectionService};
use crate::document::{BackendId, DocumentRef, ExtractedText};
use crate::error::BackendError;
use crate::retry::RetryPolicy;

/// Synchronous request size limit of the hosted service.
pub const DEFAULT_SYNC_SIZE_LIMIT: usize = 5 * 1024 * 1024;

pub struct HostedSyncOcr {
    service: Arc<dyn DetectionService>,
    sync_size_limit: usize,
    retry: RetryPolicy,
}

impl HostedSyncOcr {
    pub fn new(service: Arc<dyn DetectionService>, sync_size_limit: usize, retry: RetryPolicy) -> Self {
        Self {
            service,
            sync_size_limit,
            retry,
        }
    }

    pub async fn extract(&self, doc: &DocumentRef) -> Result<ExtractedText, BackendError> {
        if let DocumentRef::Bytes { data, .. } = doc {
            if data.len() > self.sync_size_limit {
                info!(
                    "HostedSyncOcr: {} exceeds the {} byte sync limit",
                    doc.display_name(),
                    self.sync_size_limit
                );
                return Err(BackendError::too_large(
                    "DocumentTooLargeException",
                    format!(
                        "{} bytes exceeds synchronous limit of {} bytes",
                        data.len(),
                        self.sync_size_limit
                    ),
                ));
            }
        }

        let detected = self
            .retry
            .execute(
                "HostedSyncOcr detect",
                move || self.service.detect(doc),
                BackendError::is_retryable,
            )
            .await?;
        let text = collect_lines(&detected.blocks);
        if !text.trim().is_empty() {
            info!("HostedSyncOcr: detected {} chars", text.len());
            return Ok(ExtractedText::new(text, BackendId::HostedSync)
                .with_pages(count_pages(detected.pages, &detected.blocks)));
        }

        warn!("HostedSyncOcr: no lines detected, retrying with table/form analysis");
        let analyzed = self
            .retry
            .execute(
                "HostedSyncOcr analyze",
                move || {
                    self.service
                        .analyze(doc, &[AnalysisFeature::Tables, AnalysisFeature::Forms])
                },
                BackendError::is_retryable,
            )
            .await?;
        let text = collect_lines(&analyzed.blocks);
        if text.trim().is_empty() {
            return Err(BackendError::LowQuality(
                "no text lines found by detection or table/form analysis".to_string(),
            ));
        }

        info!("HostedSyncOcr: analysis found {} chars", text.len());
        Ok(ExtractedText::new(text, BackendId::HostedSync)
            .with_pages(count_pages(analyzed.pages, &analyzed.blocks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::mock::{lines, MockDetection};
    use std::time::Duration;

    fn doc() -> DocumentRef {
        DocumentRef::from_bytes("report.pdf", b"%PDF-1.7".to_vec())
    }

    #[tokio::test]
    async fn detect_success() {
        let mock = Arc::new(MockDetection::new().with_detect(vec![Ok(lines(&["Line one", "Line two"]))]));
        let backend = HostedSyncOcr::new(mock.clone(), DEFAULT_SYNC_SIZE_LIMIT, RetryPolicy::no_retry());

        let text = backend.extract(&doc()).await.unwrap();
        assert_eq!(text.content, "Line one\nLine two\n");
        assert_eq!(text.source_backend, BackendId::HostedSync);
        assert_eq!(text.page_count, Some(1));
        assert_eq!(mock.analyze_calls(), 0);
    }

    #[tokio::test]
    async fn empty_detection_falls_back_to_analysis() {
        let mock = Arc::new(
            MockDetection::new()
                .with_detect(vec![Ok(lines(&[]))])
                .with_analyze(vec![Ok(lines(&["| Control | Result |"]))]),
        );
        let backend = HostedSyncOcr::new(mock.clone(), DEFAULT_SYNC_SIZE_LIMIT, RetryPolicy::no_retry());

        let text = backend.extract(&doc()).await.unwrap();
        assert_eq!(text.content, "| Control | Result |\n");
        assert_eq!(mock.analyze_calls(), 1);
    }

    #[tokio::test]
    async fn whitespace_everywhere_is_low_quality() {
        let mock = Arc::new(
            MockDetection::new()
                .with_detect(vec![Ok(lines(&["   "]))])
                .with_analyze(vec![Ok(lines(&["\t"]))]),
        );
        let backend = HostedSyncOcr::new(mock, DEFAULT_SYNC_SIZE_LIMIT, RetryPolicy::no_retry());

        let err = backend.extract(&doc()).await.unwrap_err();
        assert!(matches!(err, BackendError::LowQuality(_)));
    }

    #[tokio::test]
    async fn oversized_bytes_are_too_large_without_a_call() {
        let mock = Arc::new(MockDetection::new());
        let backend = HostedSyncOcr::new(mock.clone(), 4, RetryPolicy::no_retry());

        let err = backend.extract(&doc()).await.unwrap_err();
        assert!(matches!(err, BackendError::TooLarge(_)));
        assert_eq!(mock.detect_calls(), 0);
    }

    #[tokio::test]
    async fn service_errors_pass_through() {
        let mock = Arc::new(MockDetection::new().with_detect(vec![Err(BackendError::fatal(
            "UnsupportedDocumentException",
            "format not supported",
        ))]));
        let backend = HostedSyncOcr::new(mock.clone(), DEFAULT_SYNC_SIZE_LIMIT, RetryPolicy::no_retry());

        let err = backend.extract(&doc()).await.unwrap_err();
        assert_eq!(err.detail().code, "UnsupportedDocumentException");
        assert_eq!(mock.analyze_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_analysis_does_not_repeat_detection() {
        let mock = Arc::new(
            MockDetection::new()
                .with_detect(vec![Ok(lines(&[]))])
                .with_analyze(vec![Err(BackendError::retryable(
                    "ProvisionedThroughputExceededException",
                    "throughput exceeded",
                ))]),
        );
        let backend = HostedSyncOcr::new(
            mock.clone(),
            DEFAULT_SYNC_SIZE_LIMIT,
            RetryPolicy::new(3, Duration::from_secs(2), 2.0),
        );

        let err = backend.extract(&doc()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(mock.detect_calls(), 1);
        assert_eq!(mock.analyze_calls(), 3);
    }
}
