//! Persisted analysis result.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::analysis::ReportAnalysis;
use crate::document::{BackendId, ExtractedText, ExtractionAttempt};
use crate::store::Locator;

/// Generate ISO8601 timestamp for current time.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_iso8601(secs)
}

/// Format seconds since the Unix epoch as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_iso8601(secs: u64) -> String {
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let mut year = 1970i32;
    let mut remaining_days = days_since_epoch as i64;
    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let days_in_months: [i64; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1;
    for days in days_in_months {
        if remaining_days < days {
            break;
        }
        remaining_days -= days;
        month += 1;
    }
    let day = remaining_days + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

/// How the analysed text was obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionFacts {
    pub source_backend: BackendId,
    pub extracted_chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    pub truncated: bool,
    pub attempts: Vec<ExtractionAttempt>,
}

impl ExtractionFacts {
    pub fn new(text: &ExtractedText, attempts: Vec<ExtractionAttempt>) -> Self {
        Self {
            source_backend: text.source_backend,
            extracted_chars: text.content.chars().count(),
            page_count: text.page_count,
            truncated: text.truncated,
            attempts,
        }
    }
}

/// The JSON document written next to the source report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub run_id: String,
    pub source: Locator,
    pub analyzed_at: String,
    /// SHA-256 of the extracted text.
    pub content_hash: String,
    pub extractor_version: String,
    pub extraction: ExtractionFacts,
    pub analysis: ReportAnalysis,
}

/// Where the record for `source` is stored.
pub fn result_locator(source: &Locator, output_store: Option<&str>) -> Locator {
    Locator::new(
        output_store.unwrap_or(&source.store),
        format!("results/{}_analysis.json", source.stem()),
    )
}
