//! LLM review of extracted report text.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::openrouter::{Message, OpenRouterClient};
use crate::retry::RetryPolicy;

const REVIEW_PROMPT: &str = r#"You are an experienced IT auditor reviewing a SOC 2 report. Read the report text supplied by the user and return ONLY a JSON object with this structure:

{
  "executive_summary": "3-5 sentence overview of scope, opinion and notable findings",
  "quality_rating": 1-5 (1 = unusable, 5 = thorough and well evidenced),
  "controls": [
    {"id": "CC6.1", "description": "What the control does", "effectiveness": "Effective|Exception noted|Not tested"}
  ],
  "framework_mappings": {
    "CIS": ["controls covered"],
    "OWASP": ["risks covered"]
  },
  "exceptions": ["Each exception or deviation the auditor reported"],
  "recommendations": ["Follow-up actions for the relying organisation"]
}

Rules:
- Use only information present in the report.
- If the text is not a SOC 2 report or is unreadable, say so in executive_summary and rate it 1.
- Do not wrap the JSON in explanations."#;

/// Structured review of one report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportAnalysis {
    pub executive_summary: String,
    pub quality_rating: f64,
    #[serde(default)]
    pub controls: Vec<Value>,
    #[serde(default)]
    pub framework_mappings: Map<String, Value>,
    #[serde(default)]
    pub exceptions: Vec<Value>,
    #[serde(default)]
    pub recommendations: Vec<Value>,
    /// Fields the model added beyond the requested structure.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[async_trait::async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, report_name: &str, text: &str) -> Result<ReportAnalysis>;
}

pub struct LlmAnalyzer {
    client: OpenRouterClient,
    max_input_chars: usize,
    retry: RetryPolicy,
}

impl LlmAnalyzer {
    pub fn new(client: OpenRouterClient, max_input_chars: usize, retry: RetryPolicy) -> Self {
        Self {
            client,
            max_input_chars,
            retry,
        }
    }
}

#[async_trait::async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(&self, report_name: &str, text: &str) -> Result<ReportAnalysis> {
        let input = truncate_for_context(text, self.max_input_chars);
        if input.len() < text.len() {
            warn!(
                "Analysis input for {} truncated from {} to {} bytes",
                report_name,
                text.len(),
                input.len()
            );
        }
        info!(
            "Analyzing {} ({} chars) with {}",
            report_name,
            input.len(),
            self.client.model()
        );

        let messages = &vec![
            Message::system(REVIEW_PROMPT),
            Message::user(format!(
                "--- REPORT START: {} ---\n\n{}\n\n--- REPORT END ---",
                report_name, input
            )),
        ];

        let response = self
            .retry
            .execute(
                "LlmAnalyzer",
                move || self.client.chat(messages.clone()),
                LlmError::is_retryable,
            )
            .await?;
        debug!("LLM response: {} chars", response.len());

        parse_analysis(&response)
    }
}

/// Pull the review JSON out of a model response and check its shape.
pub fn parse_analysis(response: &str) -> Result<ReportAnalysis> {
    let value: Value = parse_llm_json(response)?;
    validate_analysis(&value)?;
    serde_json::from_value(value).context("Analysis JSON structure mismatch")
}

fn validate_analysis(value: &Value) -> Result<()> {
    let obj = value
        .as_object()
        .context("Analysis must be a JSON object")?;

    match obj.get("executive_summary") {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        _ => anyhow::bail!("Analysis is missing executive_summary"),
    }

    let rating = obj
        .get("quality_rating")
        .and_then(Value::as_f64)
        .context("Analysis is missing a numeric quality_rating")?;
    if !(1.0..=5.0).contains(&rating) {
        anyhow::bail!("quality_rating must be between 1 and 5, got {}", rating);
    }

    match obj.get("controls") {
        Some(Value::Array(_)) => Ok(()),
        Some(_) => anyhow::bail!("controls must be a list"),
        None => anyhow::bail!("Analysis is missing controls"),
    }
}

fn parse_llm_json<T: serde::de::DeserializeOwned>(response: &str) -> Result<T> {
    // Try to extract JSON from markdown code blocks if present
    let json_str = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    };

    // Models sometimes wrap the object in prose
    let json_str = match (json_str.find('{'), json_str.rfind('}')) {
        (Some(start), Some(end)) if start < end => &json_str[start..=end],
        _ => json_str,
    };

    serde_json::from_str(json_str).context(format!(
        "Invalid JSON in LLM response: {}",
        &json_str.chars().take(200).collect::<String>()
    ))
}

fn truncate_for_context(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"Here is the review:
```json
{
  "executive_summary": "Type II report over security and availability with an unqualified opinion.",
  "quality_rating": 4,
  "controls": [{"id": "CC6.1", "description": "Logical access", "effectiveness": "Effective"}],
  "exceptions": ["One terminated user retained access for 12 days"],
  "recommendations": ["Confirm quarterly access reviews"],
  "report_period": "2024-01-01 to 2024-12-31"
}
```"#;

    #[test]
    fn test_parse_fenced_response() {
        let analysis = parse_analysis(RESPONSE).unwrap();
        assert_eq!(analysis.quality_rating, 4.0);
        assert_eq!(analysis.controls.len(), 1);
        assert_eq!(analysis.exceptions.len(), 1);
        assert_eq!(
            analysis.extra.get("report_period").and_then(Value::as_str),
            Some("2024-01-01 to 2024-12-31")
        );
    }

    #[test]
    fn test_parse_object_inside_prose() {
        let analysis = parse_analysis(
            r#"Sure! {"executive_summary": "Not a SOC 2 report.", "quality_rating": 1, "controls": []} Hope this helps."#,
        )
        .unwrap();
        assert_eq!(analysis.executive_summary, "Not a SOC 2 report.");
        assert!(analysis.controls.is_empty());
    }

    #[test]
    fn test_rejects_out_of_range_rating() {
        let err = parse_analysis(r#"{"executive_summary": "ok", "quality_rating": 9, "controls": []}"#).unwrap_err();
        assert!(err.to_string().contains("quality_rating"));
    }

    #[test]
    fn test_rejects_missing_summary_and_bad_controls() {
        assert!(parse_analysis(r#"{"quality_rating": 3, "controls": []}"#).is_err());
        assert!(parse_analysis(r#"{"executive_summary": "ok", "quality_rating": 3}"#).is_err());
        assert!(parse_analysis(
            r#"{"executive_summary": "ok", "quality_rating": 3, "controls": "none"}"#
        )
        .is_err());
        assert!(parse_analysis("no json at all").is_err());
    }

    #[test]
    fn test_truncate_for_context_counts_chars() {
        assert_eq!(truncate_for_context("Prüfbericht", 3), "Prü");
        assert_eq!(truncate_for_context("short", 100), "short");
    }
}
