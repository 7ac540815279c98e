//! Completion notices for analysed reports.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::analysis::ReportAnalysis;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub to: Option<String>,
    pub subject: String,
    pub body: String,
}

impl Notice {
    pub fn for_analysis(
        to: Option<String>,
        report_name: &str,
        analysis: &ReportAnalysis,
        result_uri: &str,
    ) -> Self {
        Self {
            to,
            subject: format!("Report Analysis: {}", report_name),
            body: format_summary(report_name, analysis, result_uri),
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notice: &Notice) -> Result<()>;
}

/// POSTs the notice as JSON to a webhook (mail relay, chat hook, ...).
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notice: &Notice) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .context("Failed to send notification")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Notification webhook error ({}): {}", status, error_text);
        }
        info!("Notification sent: {}", notice.subject);
        Ok(())
    }
}

/// Writes the notice to the log only.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notice: &Notice) -> Result<()> {
        info!(
            "Notification for {}: {}\n{}",
            notice.to.as_deref().unwrap_or("<no recipient>"),
            notice.subject,
            notice.body
        );
        Ok(())
    }
}

fn item_text(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Plain-text body of a completion notice.
pub fn format_summary(report_name: &str, analysis: &ReportAnalysis, result_uri: &str) -> String {
    let mut body = format!(
        "Report: {}\n\nExecutive Summary\n-----------------\n{}\n\nQuality Rating: {}/5\nControls reviewed: {}\n",
        report_name,
        analysis.executive_summary,
        analysis.quality_rating,
        analysis.controls.len()
    );

    body.push_str("\nExceptions\n----------\n");
    if analysis.exceptions.is_empty() {
        body.push_str("None reported\n");
    }
    for item in &analysis.exceptions {
        body.push_str(&format!("* {}\n", item_text(item)));
    }

    body.push_str("\nRecommendations\n---------------\n");
    if analysis.recommendations.is_empty() {
        body.push_str("None\n");
    }
    for item in &analysis.recommendations {
        body.push_str(&format!("* {}\n", item_text(item)));
    }

    body.push_str(&format!("\nFull analysis: {}\n", result_uri));
    body
}
