//! Upload event parsing and input document checks.

use serde_json::Value;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::store::Locator;

/// Resolve the uploaded object from a storage notification, an EventBridge-style
/// event or a direct `{bucket, key}` invocation.
pub fn parse_upload_event(event: &Value) -> Result<Locator, PipelineError> {
    if let Some(records) = event.get("Records").and_then(Value::as_array) {
        let record = records
            .first()
            .ok_or_else(|| PipelineError::Validation("event has no records".to_string()))?;
        let s3 = record
            .get("s3")
            .ok_or_else(|| PipelineError::Validation("record is not a storage event".to_string()))?;
        let bucket = string_at(s3, &["bucket", "name"])?;
        let raw_key = string_at(s3, &["object", "key"])?;
        // Notification keys are form-encoded: spaces arrive as '+'.
        let key = urlencoding::decode(&raw_key.replace('+', " "))
            .map_err(|e| PipelineError::Validation(format!("object key is not valid UTF-8: {}", e)))?
            .into_owned();
        info!("Storage event: {}/{}", bucket, key);
        return Ok(Locator::new(bucket, key));
    }

    if let Some(detail) = event.get("detail").filter(|d| d.is_object()) {
        let bucket = name_or_string(detail.get("bucket"), "name")
            .ok_or_else(|| PipelineError::Validation("event detail has no bucket".to_string()))?;
        let key = name_or_string(detail.get("object"), "key")
            .ok_or_else(|| PipelineError::Validation("event detail has no object".to_string()))?;
        info!("EventBridge event: {}/{}", bucket, key);
        return Ok(Locator::new(bucket, key));
    }

    match (
        event.get("bucket").and_then(Value::as_str),
        event.get("key").and_then(Value::as_str),
    ) {
        (Some(bucket), Some(key)) if !bucket.is_empty() && !key.is_empty() => {
            info!("Direct invocation: {}/{}", bucket, key);
            Ok(Locator::new(bucket, key))
        }
        _ => Err(PipelineError::Validation(
            "could not find bucket and key in event".to_string(),
        )),
    }
}

fn string_at(value: &Value, path: &[&str]) -> Result<String, PipelineError> {
    let mut current = value;
    for part in path {
        current = current
            .get(part)
            .ok_or_else(|| PipelineError::Validation(format!("event is missing {}", path.join("."))))?;
    }
    current
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::Validation(format!("{} must be a non-empty string", path.join("."))))
}

/// Accepts `"value"` or `{"<field>": "value"}`.
fn name_or_string(value: Option<&Value>, field: &str) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// Reject empty, oversized or non-PDF input before any backend sees it.
pub fn validate_pdf(name: &str, data: &[u8], max_bytes: usize) -> Result<(), PipelineError> {
    if data.is_empty() {
        return Err(PipelineError::Validation(format!("{} is empty (0 bytes)", name)));
    }
    if data.len() > max_bytes {
        return Err(PipelineError::Validation(format!(
            "{} is {} bytes, limit is {} bytes",
            name,
            data.len(),
            max_bytes
        )));
    }
    if !data.starts_with(b"%PDF-") {
        return Err(PipelineError::Validation(format!(
            "{} does not start with a PDF header",
            name
        )));
    }

    let tail = &data[data.len().saturating_sub(1024)..];
    if !tail.windows(5).any(|w| w == b"%%EOF") {
        warn!("{} has no trailing %%EOF marker; it may be truncated", name);
    }
    Ok(())
}
