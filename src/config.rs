//! Runtime settings.
//!
//! Loaded from `.env`, then an optional JSON file named by `EXTRACTOR_CONFIG`,
//! then individual environment overrides. Every field has a default so a bare
//! environment still yields a working local setup.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::document::BackendId;
use crate::ocr::hosted_sync::DEFAULT_SYNC_SIZE_LIMIT;
use crate::ocr::local_tool::LocalToolSettings;
use crate::ocr::poller::DEFAULT_POLL_INTERVAL;
use crate::retry::{RetryPolicy, RetrySettings};

/// One position in the extraction chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub kind: BackendId,
    #[serde(default)]
    pub last_resort: bool,
    /// Overrides the chain-wide retry settings for this backend.
    #[serde(default)]
    pub retry: Option<RetrySettings>,
}

impl BackendEntry {
    pub fn new(kind: BackendId) -> Self {
        Self {
            kind,
            last_resort: false,
            retry: None,
        }
    }

    pub fn last_resort(mut self) -> Self {
        self.last_resort = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub sync_size_limit: usize,
    pub poll_interval_secs: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: 120,
            sync_size_limit: DEFAULT_SYNC_SIZE_LIMIT,
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
        }
    }
}

impl DetectionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub model: String,
    /// Extracted text beyond this many characters is not sent to the model.
    pub max_input_chars: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            model: crate::openrouter::DEFAULT_MODEL.to_string(),
            max_input_chars: 100_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub recipient: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Ordered extraction chain.
    pub backends: Vec<BackendEntry>,
    /// Minimum non-whitespace characters for a result to count as usable.
    pub min_content_chars: usize,
    pub max_content_chars: usize,
    /// Uploads and stored documents larger than this are rejected before extraction.
    pub max_document_bytes: usize,
    pub retry: RetrySettings,
    pub detection: DetectionSettings,
    pub local_tool: LocalToolSettings,
    pub blob_root: PathBuf,
    /// Store that receives analysis results; the source document's store when unset.
    pub output_store: Option<String>,
    pub analysis: AnalysisSettings,
    pub notification: NotificationSettings,
    /// Downgrade store/tag/notify failures to warnings.
    pub continue_on_error: bool,
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backends: default_chain(),
            min_content_chars: 100,
            max_content_chars: 500_000,
            max_document_bytes: 100 * 1024 * 1024,
            retry: RetrySettings::default(),
            detection: DetectionSettings::default(),
            local_tool: LocalToolSettings::default(),
            blob_root: PathBuf::from("./data"),
            output_store: None,
            analysis: AnalysisSettings::default(),
            notification: NotificationSettings::default(),
            continue_on_error: false,
            bind_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

/// Hosted sync, native text layer, then local OCR as last resort. The async
/// hosted backend follows them and is reached only by the large-document redirect.
pub fn default_chain() -> Vec<BackendEntry> {
    vec![
        BackendEntry::new(BackendId::HostedSync),
        BackendEntry::new(BackendId::NativeText),
        BackendEntry::new(BackendId::LocalOcr).last_resort(),
        BackendEntry::new(BackendId::HostedAsync),
    ]
}

impl Settings {
    /// Load settings from `.env`, the optional JSON file and the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut settings = match std::env::var("EXTRACTOR_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {}", path))?;
                let settings: Settings = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config: {}", path))?;
                info!("Loaded settings from {}", path);
                settings
            }
            Err(_) => Settings::default(),
        };

        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Apply `KEY=value` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DETECTION_URL") {
            self.detection.url = Some(url);
        }
        if let Some(key) = get("DETECTION_API_KEY") {
            self.detection.api_key = Some(key);
        }
        if let Some(path) = get("OCR_TOOL_PATH") {
            self.local_tool.program = PathBuf::from(path);
        }
        if let Some(root) = get("BLOB_ROOT") {
            self.blob_root = PathBuf::from(root);
        }
        if let Some(store) = get("OUTPUT_STORE") {
            self.output_store = Some(store);
        }
        if let Some(to) = get("NOTIFICATION_EMAIL") {
            self.notification.recipient = Some(to);
        }
        if let Some(url) = get("NOTIFY_WEBHOOK_URL") {
            self.notification.webhook_url = Some(url);
        }
        if let Some(model) = get("ANALYSIS_MODEL") {
            self.analysis.model = model;
        }
        if let Some(flag) = get("CONTINUE_ON_ERROR") {
            self.continue_on_error = parse_bool(&flag)
                .with_context(|| format!("CONTINUE_ON_ERROR must be true or false, got {:?}", flag))?;
        }
        if let Some(addr) = get("BIND_ADDR") {
            self.bind_addr = addr;
        }
        Ok(())
    }

    pub fn retry_for(&self, entry: &BackendEntry) -> RetryPolicy {
        entry.retry.unwrap_or(self.retry).into()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
