//! Scripted detection service for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::time::Instant;

use super::{AnalysisFeature, Block, DetectResponse, DetectionService, JobPage, JobStatus};
use crate::document::DocumentRef;
use crate::error::BackendError;

/// Responses handed out in order; the last one repeats once the list is drained.
struct Script<T: Clone> {
    queue: Mutex<Vec<T>>,
    last: Mutex<Option<T>>,
    calls: AtomicUsize,
}

impl<T: Clone> Script<T> {
    fn new(mut responses: Vec<T>) -> Self {
        responses.reverse();
        Self {
            queue: Mutex::new(responses),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Option<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let popped = self.queue.lock().unwrap().pop();
        let mut last = self.last.lock().unwrap();
        if let Some(value) = popped {
            *last = Some(value);
        }
        last.clone()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn unscripted(op: &str) -> BackendError {
    BackendError::fatal("NotScripted", format!("mock has no {} response", op))
}

pub struct MockDetection {
    detect: Script<Result<DetectResponse, BackendError>>,
    analyze: Script<Result<DetectResponse, BackendError>>,
    submit: Script<Result<String, BackendError>>,
    poll: Script<Result<JobPage, BackendError>>,
    poll_log: Mutex<Vec<(Option<String>, Instant)>>,
}

impl MockDetection {
    pub fn new() -> Self {
        Self {
            detect: Script::new(Vec::new()),
            analyze: Script::new(Vec::new()),
            submit: Script::new(Vec::new()),
            poll: Script::new(Vec::new()),
            poll_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_detect(mut self, responses: Vec<Result<DetectResponse, BackendError>>) -> Self {
        self.detect = Script::new(responses);
        self
    }

    pub fn with_analyze(mut self, responses: Vec<Result<DetectResponse, BackendError>>) -> Self {
        self.analyze = Script::new(responses);
        self
    }

    pub fn with_submit(mut self, responses: Vec<Result<String, BackendError>>) -> Self {
        self.submit = Script::new(responses);
        self
    }

    pub fn with_poll(mut self, responses: Vec<Result<JobPage, BackendError>>) -> Self {
        self.poll = Script::new(responses);
        self
    }

    pub fn detect_calls(&self) -> usize {
        self.detect.calls()
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze.calls()
    }

    pub fn submit_calls(&self) -> usize {
        self.submit.calls()
    }

    pub fn poll_calls(&self) -> usize {
        self.poll.calls()
    }

    /// `(next_token, time)` of every poll, in call order.
    pub fn poll_log(&self) -> Vec<(Option<String>, Instant)> {
        self.poll_log.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DetectionService for MockDetection {
    async fn detect(&self, _doc: &DocumentRef) -> Result<DetectResponse, BackendError> {
        self.detect.next().unwrap_or_else(|| Err(unscripted("detect")))
    }

    async fn analyze(
        &self,
        _doc: &DocumentRef,
        _features: &[AnalysisFeature],
    ) -> Result<DetectResponse, BackendError> {
        self.analyze.next().unwrap_or_else(|| Err(unscripted("analyze")))
    }

    async fn submit(&self, _doc: &DocumentRef) -> Result<String, BackendError> {
        self.submit.next().unwrap_or_else(|| Err(unscripted("submit")))
    }

    async fn poll(&self, _job_id: &str, next_token: Option<&str>) -> Result<JobPage, BackendError> {
        self.poll_log
            .lock()
            .unwrap()
            .push((next_token.map(str::to_string), Instant::now()));
        self.poll.next().unwrap_or_else(|| Err(unscripted("poll")))
    }
}

/// Detection response made of LINE blocks.
pub fn lines(texts: &[&str]) -> DetectResponse {
    DetectResponse {
        blocks: texts.iter().map(|t| Block::line(*t)).collect(),
        pages: Some(1),
    }
}

/// Job query response carrying LINE blocks.
pub fn job_page(status: JobStatus, texts: &[&str], next_token: Option<&str>) -> JobPage {
    JobPage {
        job_status: status,
        status_message: None,
        blocks: texts.iter().map(|t| Block::line(*t)).collect(),
        next_token: next_token.map(str::to_string),
        pages: None,
    }
}

/// A paragraph comfortably above the default quality floor.
pub const LONG_TEXT: &str = "Independent Service Auditor's Report on Controls Relevant to Security and \
Availability. Management of the service organization is responsible for designing, implementing \
and operating effective controls throughout the review period.";
