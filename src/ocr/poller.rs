//! Polling loop for asynchronous detection jobs.
//!
//! The job is queried every `interval` until it leaves `IN_PROGRESS`. Once it
//! has succeeded, the remaining result pages are fetched back to back using the
//! continuation token of each page.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{collect_lines, count_pages, Block, DetectionService, JobPage, JobStatus};
use crate::error::BackendError;
use crate::retry::RetryPolicy;

/// Default wait between status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    Submitted,
    Polling,
    Succeeded,
    Failed,
}

/// Text and page count gathered from every result page of a finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub text: String,
    pub pages: Option<u32>,
    pub result_pages: usize,
}

pub struct AsyncJobPoller {
    service: Arc<dyn DetectionService>,
    interval: Duration,
    retry: RetryPolicy,
}

impl AsyncJobPoller {
    pub fn new(service: Arc<dyn DetectionService>, interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            service,
            interval,
            retry,
        }
    }

    async fn query(&self, job_id: &str, next_token: Option<&str>) -> Result<JobPage, BackendError> {
        self.retry
            .execute(
                "AsyncJobPoller",
                move || self.service.poll(job_id, next_token),
                BackendError::is_retryable,
            )
            .await
    }

    /// Wait for `job_id` to finish and collect its text.
    ///
    /// Sleeps for the poll interval before each status query; there is no
    /// overall deadline.
    pub async fn run(&self, job_id: &str) -> Result<JobResult, BackendError> {
        let mut state = PollState::Submitted;
        let mut polls = 0u32;
        let mut first_page = None;

        while first_page.is_none() {
            tokio::time::sleep(self.interval).await;
            polls += 1;
            let page = self.query(job_id, None).await?;
            debug!(
                "AsyncJobPoller: job {} poll {} status {:?}",
                job_id, polls, page.job_status
            );

            match page.job_status {
                JobStatus::InProgress => {
                    if state == PollState::Submitted {
                        state = PollState::Polling;
                    }
                }
                JobStatus::Failed => {
                    state = PollState::Failed;
                    let message = page
                        .status_message
                        .unwrap_or_else(|| "job reported FAILED".to_string());
                    warn!("AsyncJobPoller: job {} {:?}: {}", job_id, state, message);
                    return Err(BackendError::fatal("JobFailed", message));
                }
                JobStatus::PartialSuccess => {
                    warn!(
                        "AsyncJobPoller: job {} finished with partial success, collecting available pages",
                        job_id
                    );
                    state = PollState::Succeeded;
                    first_page = Some(page);
                }
                JobStatus::Succeeded => {
                    state = PollState::Succeeded;
                    first_page = Some(page);
                }
            }
        }

        let Some(first) = first_page else {
            return Err(BackendError::fatal("JobFailed", "job ended without results"));
        };
        info!(
            "AsyncJobPoller: job {} {:?} after {} polls",
            job_id, state, polls
        );

        let mut pages = count_pages(first.pages, &first.blocks);
        let mut blocks: Vec<Block> = first.blocks;
        let mut next_token = first.next_token;
        let mut result_pages = 1;

        while let Some(token) = next_token.take() {
            let page = self.query(job_id, Some(&token)).await?;
            result_pages += 1;
            pages = pages.or(page.pages);
            blocks.extend(page.blocks);
            next_token = page.next_token;
        }

        let pages = pages.or_else(|| count_pages(None, &blocks));
        debug!(
            "AsyncJobPoller: job {} returned {} result pages, {} blocks",
            job_id,
            result_pages,
            blocks.len()
        );

        Ok(JobResult {
            text: collect_lines(&blocks),
            pages,
            result_pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::mock::{job_page, MockDetection};
    use tokio::time::Instant;

    fn poller(mock: Arc<MockDetection>) -> AsyncJobPoller {
        AsyncJobPoller::new(
            mock,
            DEFAULT_POLL_INTERVAL,
            RetryPolicy::new(3, Duration::from_secs(2), 2.0),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_success_then_pages_through_results() {
        let mock = Arc::new(MockDetection::new().with_poll(vec![
            Ok(job_page(JobStatus::InProgress, &[], None)),
            Ok(job_page(JobStatus::InProgress, &[], None)),
            Ok(job_page(JobStatus::Succeeded, &["page one a", "page one b"], Some("t1"))),
            Ok(job_page(JobStatus::Succeeded, &["page two"], None)),
        ]));
        let start = Instant::now();

        let result = poller(mock.clone()).run("job-1").await.unwrap();

        assert_eq!(result.text, "page one a\npage one b\npage two\n");
        assert_eq!(result.result_pages, 2);
        assert_eq!(mock.poll_calls(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(15));

        let log = mock.poll_log();
        assert_eq!(log[2].0, None);
        assert_eq!(log[3].0.as_deref(), Some("t1"));
        assert_eq!(log[3].1, log[2].1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_stops_polling() {
        let mut failed = job_page(JobStatus::Failed, &[], None);
        failed.status_message = Some("Unable to read document".to_string());
        let mock = Arc::new(MockDetection::new().with_poll(vec![
            Ok(job_page(JobStatus::InProgress, &[], None)),
            Ok(failed),
        ]));

        let err = poller(mock.clone()).run("job-2").await.unwrap_err();

        assert_eq!(err.detail().code, "JobFailed");
        assert_eq!(err.detail().message, "Unable to read document");
        assert_eq!(mock.poll_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_success_is_accepted() {
        let mock = Arc::new(MockDetection::new().with_poll(vec![Ok(job_page(
            JobStatus::PartialSuccess,
            &["recovered text"],
            None,
        ))]));

        let result = poller(mock.clone()).run("job-3").await.unwrap();
        assert_eq!(result.text, "recovered text\n");
        assert_eq!(mock.poll_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_poll_is_retried() {
        let mock = Arc::new(MockDetection::new().with_poll(vec![
            Err(BackendError::retryable("ThrottlingException", "slow down")),
            Ok(job_page(JobStatus::Succeeded, &["done"], None)),
        ]));
        let start = Instant::now();

        let result = poller(mock.clone()).run("job-4").await.unwrap();

        assert_eq!(result.text, "done\n");
        assert_eq!(mock.poll_calls(), 2);
        // One poll interval plus one 2s backoff.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_job_id_is_not_retried() {
        let mock = Arc::new(MockDetection::new().with_poll(vec![Err(BackendError::fatal(
            "InvalidJobIdException",
            "unknown job",
        ))]));

        let err = poller(mock.clone()).run("missing").await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(mock.poll_calls(), 1);
    }
}
