//! Ordered fallback across extraction backends.
//!
//! Each backend runs under its own retry policy, applied once per outbound
//! call and never nested. Results below the quality floor move the chain on
//! to the next backend; a too-large document is redirected to the async
//! hosted backend wherever it sits in the list; the last-resort backend
//! always ends the chain.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::document::{AttemptOutcome, BackendId, DocumentRef, ExtractedText, ExtractionAttempt};
use crate::error::{BackendError, ExtractionError};
use crate::ocr::poller::AsyncJobPoller;
use crate::ocr::{
    Backend, DetectionService, HostedAsyncOcr, HostedSyncOcr, LocalOcrTool, NativeTextLayer,
};
use crate::retry::RetryPolicy;
use crate::store::BlobStore;

/// Returned by the last-resort backend when it cannot read the document either.
pub const CORRUPTED_DOCUMENT_NOTICE: &str =
    "Failed to extract text from corrupted PDF. Please check the document's integrity.";

pub struct BackendSlot {
    pub backend: Backend,
    /// Wraps whole calls to local backends. Hosted backends were built with
    /// the same policy and apply it to each service call instead.
    pub retry: RetryPolicy,
    /// Output accepted unconditionally; failures become [`CORRUPTED_DOCUMENT_NOTICE`].
    pub last_resort: bool,
}

impl BackendSlot {
    pub fn new(backend: Backend, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            last_resort: false,
        }
    }

    pub fn last_resort(mut self) -> Self {
        self.last_resort = true;
        self
    }
}

/// Result of one run together with the log of every backend tried.
#[derive(Debug)]
pub struct ExtractionReport {
    pub result: Result<ExtractedText, ExtractionError>,
    pub attempts: Vec<ExtractionAttempt>,
}

pub struct ExtractionOrchestrator {
    slots: Vec<BackendSlot>,
    min_content_chars: usize,
    max_content_chars: usize,
}

/// Usable text has more than `min_chars` non-whitespace characters.
pub fn passes_quality(text: &str, min_chars: usize) -> bool {
    text.chars().filter(|c| !c.is_whitespace()).count() > min_chars
}

impl ExtractionOrchestrator {
    pub fn new(slots: Vec<BackendSlot>, min_content_chars: usize, max_content_chars: usize) -> Self {
        Self {
            slots,
            min_content_chars,
            max_content_chars,
        }
    }

    /// Build the configured chain. Hosted entries are skipped when no detection
    /// service is available.
    pub fn from_settings(
        settings: &Settings,
        detection: Option<Arc<dyn DetectionService>>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let mut slots = Vec::with_capacity(settings.backends.len());

        for entry in &settings.backends {
            let retry = settings.retry_for(entry);
            let backend = match (entry.kind, &detection) {
                (BackendId::HostedSync, Some(service)) => Backend::HostedSync(HostedSyncOcr::new(
                    Arc::clone(service),
                    settings.detection.sync_size_limit,
                    retry,
                )),
                (BackendId::HostedAsync, Some(service)) => {
                    let poller = AsyncJobPoller::new(
                        Arc::clone(service),
                        settings.detection.poll_interval(),
                        retry,
                    );
                    Backend::HostedAsync(HostedAsyncOcr::new(Arc::clone(service), poller, retry))
                }
                (BackendId::HostedSync | BackendId::HostedAsync, None) => {
                    warn!(
                        "Skipping {} backend: no detection service configured",
                        entry.kind
                    );
                    continue;
                }
                (BackendId::NativeText, _) => {
                    Backend::NativeText(NativeTextLayer::new(Arc::clone(&store)))
                }
                (BackendId::LocalOcr, _) => Backend::LocalOcr(LocalOcrTool::new(
                    settings.local_tool.clone(),
                    Arc::clone(&store),
                )),
            };

            let slot = BackendSlot::new(backend, retry);
            slots.push(if entry.last_resort { slot.last_resort() } else { slot });
        }

        info!(
            "Extraction chain: [{}]",
            slots
                .iter()
                .map(|s| {
                    let marker = if s.last_resort { ", last resort" } else { "" };
                    format!(
                        "{} ({} attempts{})",
                        s.backend.id(),
                        s.retry.max_attempts(),
                        marker
                    )
                })
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self::new(slots, settings.min_content_chars, settings.max_content_chars)
    }

    /// [`Self::from_settings`] on the blocking pool, since building the chain
    /// may run the local OCR tool's version check.
    pub async fn build(
        settings: &Settings,
        detection: Option<Arc<dyn DetectionService>>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self, tokio::task::JoinError> {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || Self::from_settings(&settings, detection, store)).await
    }

    #[cfg(test)]
    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.slots.iter().map(|s| s.backend.id()).collect()
    }

    #[cfg(test)]
    pub async fn extract(&self, doc: &DocumentRef) -> Result<ExtractedText, ExtractionError> {
        self.extract_with_log(doc).await.result
    }

    /// Run the chain, returning the result and the attempt log.
    pub async fn extract_with_log(&self, doc: &DocumentRef) -> ExtractionReport {
        let mut attempts = Vec::new();
        let result = self.run_chain(doc, &mut attempts).await;
        ExtractionReport { result, attempts }
    }

    async fn run_chain(
        &self,
        doc: &DocumentRef,
        attempts: &mut Vec<ExtractionAttempt>,
    ) -> Result<ExtractedText, ExtractionError> {
        if self.slots.is_empty() {
            return Err(ExtractionError::NoBackends);
        }

        let mut tried = vec![false; self.slots.len()];
        let mut cursor = 0;
        // Slot that redirected to the async backend; the chain resumes after it.
        let mut detour_origin: Option<usize> = None;
        let mut last_failure: Option<(BackendId, BackendError)> = None;

        while cursor < self.slots.len() {
            let idx = cursor;
            if tried[idx] {
                cursor += 1;
                continue;
            }
            tried[idx] = true;

            let slot = &self.slots[idx];
            let id = slot.backend.id();
            debug!("Trying {} on {}", id, doc.display_name());

            let outcome = if slot.backend.retries_service_calls() {
                slot.backend.extract(doc).await
            } else {
                slot.retry
                    .execute(
                        id.as_str(),
                        move || slot.backend.extract(doc),
                        BackendError::is_retryable,
                    )
                    .await
            };
            let origin = detour_origin.take();
            let next = origin.unwrap_or(idx) + 1;
            // A detour taken from the last-resort slot still ends the chain.
            let ends_chain = slot.last_resort || origin.is_some_and(|o| self.slots[o].last_resort);

            let err = match outcome {
                Ok(text) if slot.last_resort || passes_quality(&text.content, self.min_content_chars) => {
                    info!(
                        "{} extracted {} chars from {}",
                        id,
                        text.content.len(),
                        doc.display_name()
                    );
                    attempts.push(ExtractionAttempt {
                        backend: id,
                        outcome: AttemptOutcome::Success,
                        error: None,
                    });
                    return Ok(text.truncate_to(self.max_content_chars));
                }
                Ok(text) => BackendError::LowQuality(format!(
                    "{} non-whitespace chars, need more than {}",
                    text.content.chars().filter(|c| !c.is_whitespace()).count(),
                    self.min_content_chars
                )),
                Err(err) => err,
            };

            attempts.push(ExtractionAttempt {
                backend: id,
                outcome: err.outcome(),
                error: Some(err.detail()),
            });

            if matches!(err, BackendError::TooLarge(_)) {
                if let Some(async_idx) = self.untried_async(&tried) {
                    info!(
                        "{} reported {}; redirecting to {}",
                        id,
                        err,
                        BackendId::HostedAsync
                    );
                    detour_origin = Some(origin.unwrap_or(idx));
                    cursor = async_idx;
                    last_failure = Some((id, err));
                    continue;
                }
                warn!("{} reported {} and no async backend is available", id, err);
            }

            if ends_chain {
                warn!(
                    "Last-resort backend {} failed on {}: {}",
                    id,
                    doc.display_name(),
                    err
                );
                return Ok(ExtractedText::new(CORRUPTED_DOCUMENT_NOTICE.to_string(), id));
            }

            warn!("{} failed on {}: {}; falling back", id, doc.display_name(), err);
            last_failure = Some((id, err));
            cursor = next;
        }

        match last_failure {
            Some((backend, source)) => {
                warn!(
                    "All extraction backends failed for {}; last was {}: {}",
                    doc.display_name(),
                    backend,
                    source
                );
                Err(ExtractionError::AllFailed {
                    backend,
                    attempts: attempts.len(),
                    source,
                })
            }
            None => Err(ExtractionError::NoBackends),
        }
    }

    fn untried_async(&self, tried: &[bool]) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .position(|(i, s)| !tried[i] && matches!(s.backend, Backend::HostedAsync(_)))
    }
}
