//! Hosted OCR, asynchronous job mode. No size limit; used for large documents.
//!
//! Submission and each status query are retried separately; a job is never
//! submitted twice once the service has accepted it.

use std::sync::Arc;

use tracing::info;

use super::poller::AsyncJobPoller;
use super::DetectionService;
use crate::document::{BackendId, DocumentRef, ExtractedText};
use crate::error::BackendError;
use crate::retry::RetryPolicy;

pub struct HostedAsyncOcr {
    service: Arc<dyn DetectionService>,
    poller: AsyncJobPoller,
    retry: RetryPolicy,
}

impl HostedAsyncOcr {
    pub fn new(service: Arc<dyn DetectionService>, poller: AsyncJobPoller, retry: RetryPolicy) -> Self {
        Self {
            service,
            poller,
            retry,
        }
    }

    pub async fn extract(&self, doc: &DocumentRef) -> Result<ExtractedText, BackendError> {
        let job_id = self
            .retry
            .execute(
                "HostedAsyncOcr submit",
                move || self.service.submit(doc),
                BackendError::is_retryable,
            )
            .await?;
        info!(
            "HostedAsyncOcr: job {} started for {}",
            job_id,
            doc.display_name()
        );

        let result = self.poller.run(&job_id).await?;
        if result.text.trim().is_empty() {
            return Err(BackendError::LowQuality(format!(
                "job {} returned no text lines",
                job_id
            )));
        }

        Ok(ExtractedText::new(result.text, BackendId::HostedAsync).with_pages(result.pages))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ocr::mock::{job_page, MockDetection};
    use crate::ocr::JobStatus;
    use crate::retry::RetryPolicy;
    use crate::store::Locator;

    fn backend(mock: Arc<MockDetection>) -> HostedAsyncOcr {
        backend_with(mock, RetryPolicy::no_retry())
    }

    fn backend_with(mock: Arc<MockDetection>, retry: RetryPolicy) -> HostedAsyncOcr {
        let poller = AsyncJobPoller::new(mock.clone(), Duration::from_secs(5), retry);
        HostedAsyncOcr::new(mock, poller, retry)
    }

    #[tokio::test(start_paused = true)]
    async fn submit_then_collect() {
        let mock = Arc::new(
            MockDetection::new()
                .with_submit(vec![Ok("job-9".to_string())])
                .with_poll(vec![Ok(job_page(JobStatus::Succeeded, &["large report"], None))]),
        );
        let doc = DocumentRef::stored(Locator::new("uploads", "big.pdf"));

        let text = backend(mock.clone()).extract(&doc).await.unwrap();
        assert_eq!(text.content, "large report\n");
        assert_eq!(text.source_backend, BackendId::HostedAsync);
        assert_eq!(mock.submit_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_failure_skips_polling() {
        let mock = Arc::new(MockDetection::new().with_submit(vec![Err(BackendError::fatal(
            "InvalidS3ObjectException",
            "no such object",
        ))]));
        let doc = DocumentRef::stored(Locator::new("uploads", "gone.pdf"));

        let err = backend(mock.clone()).extract(&doc).await.unwrap_err();
        assert_eq!(err.detail().code, "InvalidS3ObjectException");
        assert_eq!(mock.poll_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_job_is_low_quality() {
        let mock = Arc::new(
            MockDetection::new()
                .with_submit(vec![Ok("job-10".to_string())])
                .with_poll(vec![Ok(job_page(JobStatus::Succeeded, &[], None))]),
        );
        let doc = DocumentRef::from_bytes("scan.pdf", b"%PDF-1.4".to_vec());

        let err = backend(mock).extract(&doc).await.unwrap_err();
        assert!(matches!(err, BackendError::LowQuality(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_polls_keep_the_submitted_job() {
        let mock = Arc::new(
            MockDetection::new()
                .with_submit(vec![Ok("job-11".to_string())])
                .with_poll(vec![Err(BackendError::retryable("ThrottlingException", "slow down"))]),
        );
        let doc = DocumentRef::stored(Locator::new("uploads", "big.pdf"));
        let retry = RetryPolicy::new(3, Duration::from_secs(2), 2.0);

        let err = backend_with(mock.clone(), retry).extract(&doc).await.unwrap_err();
        assert_eq!(err.detail().code, "ThrottlingException");
        assert_eq!(mock.submit_calls(), 1);
        assert_eq!(mock.poll_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_submit_is_retried() {
        let mock = Arc::new(
            MockDetection::new()
                .with_submit(vec![
                    Err(BackendError::retryable("LimitExceededException", "too many jobs")),
                    Ok("job-12".to_string()),
                ])
                .with_poll(vec![Ok(job_page(JobStatus::Succeeded, &["late start"], None))]),
        );
        let doc = DocumentRef::stored(Locator::new("uploads", "big.pdf"));
        let retry = RetryPolicy::new(3, Duration::from_secs(2), 2.0);

        let text = backend_with(mock.clone(), retry).extract(&doc).await.unwrap();
        assert_eq!(text.content, "late start\n");
        assert_eq!(mock.submit_calls(), 2);
        assert_eq!(mock.poll_calls(), 1);
    }
}
