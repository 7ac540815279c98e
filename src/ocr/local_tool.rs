//! External OCR executable (ocrmypdf by default).
//!
//! The tool rewrites the document with a recognised text layer, which is then
//! read back through the native text layer parser. Availability is checked once
//! per program path and remembered for the life of the process.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::native::parse_in_background;
use crate::document::{BackendId, DocumentRef, ExtractedText};
use crate::error::BackendError;
use crate::store::{load_document, BlobStore};

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.\d+(?:\.\d+)?)").expect("valid version regex"));

/// Detected versions keyed by program path. `None` means the tool is unavailable.
static VERSIONS: Lazy<Mutex<HashMap<PathBuf, Option<String>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalToolSettings {
    pub program: PathBuf,
    pub language: String,
    pub deskew: bool,
    pub clean: bool,
    pub rotate_pages: bool,
    pub optimize: u8,
    /// Parent directory for per-call scratch directories; system temp when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for LocalToolSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ocrmypdf"),
            language: "eng".to_string(),
            deskew: true,
            clean: false,
            rotate_pages: true,
            optimize: 1,
            scratch_dir: None,
        }
    }
}

pub struct LocalOcrTool {
    settings: LocalToolSettings,
    version: Option<String>,
    store: Arc<dyn BlobStore>,
}

impl LocalOcrTool {
    /// Builds the backend, running the tool's version check on first use of this program path.
    pub fn new(settings: LocalToolSettings, store: Arc<dyn BlobStore>) -> Self {
        let version = detect_version(&settings.program);
        Self {
            settings,
            version,
            store,
        }
    }

    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--force-ocr".into(),
            "--output-type".into(),
            "pdf".into(),
            "--quiet".into(),
            "-l".into(),
            self.settings.language.clone().into(),
        ];
        if self.settings.deskew {
            args.push("--deskew".into());
        }
        if self.settings.clean {
            args.push("--clean".into());
        }
        if self.settings.rotate_pages {
            args.push("--rotate-pages".into());
        }
        if self.settings.optimize > 0 {
            args.push("--optimize".into());
            args.push(self.settings.optimize.to_string().into());
        }
        args.push(input.into());
        args.push(output.into());
        args
    }

    pub async fn extract(&self, doc: &DocumentRef) -> Result<ExtractedText, BackendError> {
        if !self.is_available() {
            return Err(BackendError::fatal(
                "ToolUnavailable",
                format!("{} is not installed", self.settings.program.display()),
            ));
        }

        let data = load_document(doc, self.store.as_ref()).await?;

        let scratch = match &self.settings.scratch_dir {
            Some(dir) => tempfile::Builder::new().prefix("ocr-").tempdir_in(dir),
            None => tempfile::Builder::new().prefix("ocr-").tempdir(),
        }
        .map_err(|e| BackendError::fatal("ScratchDir", e.to_string()))?;

        let input = scratch.path().join("input.pdf");
        let output = scratch.path().join("output.pdf");
        tokio::fs::write(&input, &data[..])
            .await
            .map_err(|e| BackendError::fatal("ScratchDir", e.to_string()))?;

        info!(
            "LocalOcrTool: running {} {} on {}",
            self.settings.program.display(),
            self.version().unwrap_or("(unknown version)"),
            doc.display_name()
        );
        let result = tokio::process::Command::new(&self.settings.program)
            .args(self.args(&input, &output))
            .output()
            .await
            .map_err(|e| {
                BackendError::fatal(
                    "ToolInvocationFailed",
                    format!("failed to start {}: {}", self.settings.program.display(), e),
                )
            })?;

        if !result.status.success() {
            let stdout = String::from_utf8_lossy(&result.stdout);
            let stderr = String::from_utf8_lossy(&result.stderr);
            warn!(
                "LocalOcrTool: exited with {:?}: {}",
                result.status.code(),
                stderr.trim()
            );
            return Err(BackendError::fatal(
                "ToolExitStatus",
                format!(
                    "exit code {}; stdout: {}; stderr: {}",
                    result
                        .status
                        .code()
                        .map_or_else(|| "none".to_string(), |c| c.to_string()),
                    stdout.trim(),
                    stderr.trim()
                ),
            ));
        }

        let recognised = tokio::fs::read(&output).await.map_err(|e| {
            BackendError::fatal("ToolOutputMissing", format!("{}: {}", output.display(), e))
        })?;
        let parsed = parse_in_background(recognised.into()).await?;
        debug!(
            "LocalOcrTool: {} pages recognised, {} chars",
            parsed.pages,
            parsed.text.len()
        );

        Ok(ExtractedText::new(parsed.text, BackendId::LocalOcr).with_pages(Some(parsed.pages)))
    }
}

/// Run `<program> --version` once per program path and cache the parsed version.
fn detect_version(program: &Path) -> Option<String> {
    let mut versions = match VERSIONS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(cached) = versions.get(program) {
        return cached.clone();
    }

    let version = match std::process::Command::new(program).arg("--version").output() {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let stderr = String::from_utf8_lossy(&out.stderr);
            let found = parse_version(&stdout)
                .or_else(|| parse_version(&stderr))
                .unwrap_or_else(|| "unknown".to_string());
            info!("LocalOcrTool: found {} version {}", program.display(), found);
            Some(found)
        }
        Ok(out) => {
            warn!(
                "LocalOcrTool: {} --version exited with {:?}, disabling local OCR",
                program.display(),
                out.status.code()
            );
            None
        }
        Err(e) => {
            warn!(
                "LocalOcrTool: {} not available ({}), disabling local OCR",
                program.display(),
                e
            );
            None
        }
    };

    versions.insert(program.to_path_buf(), version.clone());
    version
}

fn parse_version(text: &str) -> Option<String> {
    VERSION_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
