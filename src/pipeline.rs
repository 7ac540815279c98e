//! End-to-end processing of one uploaded report.
//!
//! event → fetch → validate → extract → analyze → store result → tag source
//! → notify. Extraction and analysis failures always fail the run; with
//! `continue_on_error` the last three stages only add warnings.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::Analyzer;
use crate::config::Settings;
use crate::document::{BackendId, DocumentRef, ExtractedText, ExtractionAttempt};
use crate::error::{PipelineError, StoreError};
use crate::event::{parse_upload_event, validate_pdf};
use crate::notify::{Notice, Notifier};
use crate::orchestrator::ExtractionOrchestrator;
use crate::record::{now_iso8601, result_locator, AnalysisRecord, ExtractionFacts};
use crate::store::{BlobStore, Locator};

pub const STATUS_TAG: &str = "Status";

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub output_store: Option<String>,
    pub recipient: Option<String>,
    pub continue_on_error: bool,
    pub max_document_bytes: usize,
}

impl From<&Settings> for PipelineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            output_store: settings.output_store.clone(),
            recipient: settings.notification.recipient.clone(),
            continue_on_error: settings.continue_on_error,
            max_document_bytes: settings.max_document_bytes,
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub document: Locator,
    pub content_hash: String,
    pub source_backend: BackendId,
    pub extracted_chars: usize,
    pub quality_rating: f64,
    pub result: Locator,
    pub result_uri: String,
    /// Failures tolerated under continue-on-error.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Text pulled from an uploaded file, with the backends that were tried.
#[derive(Debug, Clone, Serialize)]
pub struct UploadExtraction {
    pub text: ExtractedText,
    pub attempts: Vec<ExtractionAttempt>,
}

pub struct ReportPipeline {
    store: Arc<dyn BlobStore>,
    extractor: ExtractionOrchestrator,
    analyzer: Arc<dyn Analyzer>,
    notifier: Arc<dyn Notifier>,
    options: PipelineOptions,
}

impl ReportPipeline {
    pub fn new(
        store: Arc<dyn BlobStore>,
        extractor: ExtractionOrchestrator,
        analyzer: Arc<dyn Analyzer>,
        notifier: Arc<dyn Notifier>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            extractor,
            analyzer,
            notifier,
            options,
        }
    }

    pub async fn handle_event(&self, event: &Value) -> Result<PipelineOutcome, PipelineError> {
        let locator = parse_upload_event(event)?;
        self.process(&locator).await
    }

    pub async fn process(&self, locator: &Locator) -> Result<PipelineOutcome, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let report_name = locator.stem().to_string();
        info!("Run {}: processing {}", run_id, locator);

        let data = self.store.get(locator).await.map_err(|e| match e {
            StoreError::NotFound(path) => PipelineError::NotFound(path),
            other => PipelineError::stage("fetch", other),
        })?;
        validate_pdf(&locator.path, &data, self.options.max_document_bytes)?;
        debug!("Run {}: fetched and validated {} bytes", run_id, data.len());

        let doc = DocumentRef::fetched(locator.clone(), data);
        let report = self.extractor.extract_with_log(&doc).await;
        let text = match report.result {
            Ok(text) => text,
            Err(e) => {
                error!("Run {}: extraction failed for {}: {}", run_id, locator, e);
                if let Err(tag_err) = self.store.tag(locator, STATUS_TAG, "Failed").await {
                    warn!("Run {}: could not tag {} as failed: {}", run_id, locator, tag_err);
                }
                return Err(e.into());
            }
        };
        if text.truncated {
            warn!(
                "Run {}: extracted text truncated to {} chars",
                run_id,
                text.content.chars().count()
            );
        }

        let content_hash = {
            let mut hasher = Sha256::new();
            hasher.update(text.content.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        let analysis = self
            .analyzer
            .analyze(&report_name, &text.content)
            .await
            .map_err(|e| PipelineError::stage("analysis", e))?;

        let facts = ExtractionFacts::new(&text, report.attempts);
        let record = AnalysisRecord {
            run_id: run_id.clone(),
            source: locator.clone(),
            analyzed_at: now_iso8601(),
            content_hash: content_hash.clone(),
            extractor_version: env!("CARGO_PKG_VERSION").to_string(),
            extraction: facts,
            analysis,
        };

        debug!(
            "Run {}: analysis rated {}/5",
            run_id, record.analysis.quality_rating
        );

        let result = result_locator(locator, self.options.output_store.as_deref());
        let result_uri = self.store.uri(&result);
        let mut warnings = Vec::new();

        let stored = match serde_json::to_vec_pretty(&record) {
            Ok(json) => self
                .store
                .put(&result, &json, "application/json")
                .await
                .map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        self.soft_stage(&run_id, "store", stored, &mut warnings)?;

        let tagged = self
            .store
            .tag(locator, STATUS_TAG, "Analyzed")
            .await
            .map_err(anyhow::Error::from);
        self.soft_stage(&run_id, "tag", tagged, &mut warnings)?;

        let notice = Notice::for_analysis(
            self.options.recipient.clone(),
            &report_name,
            &record.analysis,
            &result_uri,
        );
        let notified = self.notifier.send(&notice).await;
        self.soft_stage(&run_id, "notify", notified, &mut warnings)?;

        info!(
            "Run {}: {} analysed via {} ({} warnings)",
            run_id,
            locator,
            text.source_backend,
            warnings.len()
        );

        Ok(PipelineOutcome {
            run_id,
            document: locator.clone(),
            content_hash,
            source_backend: text.source_backend,
            extracted_chars: record.extraction.extracted_chars,
            quality_rating: record.analysis.quality_rating,
            result,
            result_uri,
            warnings,
        })
    }

    /// Extract text from an uploaded file without analysing or storing it.
    pub async fn extract_upload(&self, name: &str, data: Vec<u8>) -> Result<UploadExtraction, PipelineError> {
        validate_pdf(name, &data, self.options.max_document_bytes)?;
        let doc = DocumentRef::from_bytes(name, data);
        let report = self.extractor.extract_with_log(&doc).await;
        let text = report.result?;
        Ok(UploadExtraction {
            text,
            attempts: report.attempts,
        })
    }

    fn soft_stage(
        &self,
        run_id: &str,
        stage: &'static str,
        result: anyhow::Result<()>,
        warnings: &mut Vec<String>,
    ) -> Result<(), PipelineError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.options.continue_on_error => {
                warn!("Run {}: {} stage failed, continuing: {:#}", run_id, stage, e);
                warnings.push(format!("{} stage failed: {:#}", stage, e));
                Ok(())
            }
            Err(e) => Err(PipelineError::stage(stage, e)),
        }
    }
}
