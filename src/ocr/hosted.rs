//! HTTP client for the hosted OCR/detection service.
//!
//! Documents are sent either as an object reference the service can read on
//! its own, or inline as base64. Error bodies carry `{code, message}`; the code
//! decides how the failure is classified.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AnalysisFeature, DetectResponse, DetectionService, JobPage};
use crate::document::DocumentRef;
use crate::error::BackendError;

pub struct HttpDetectionClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDetectionClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(&self, op: &str, request: RequestBuilder) -> Result<T, BackendError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| transport_error(op, e))?;
        let response = check_status(op, response).await?;
        let raw = response.text().await.map_err(|e| transport_error(op, e))?;
        debug!(
            "HttpDetectionClient: {} response ({} bytes): {}",
            op,
            raw.len(),
            &raw[..floor_char_boundary(&raw, 300)]
        );
        serde_json::from_str(&raw)
            .map_err(|e| BackendError::fatal("MalformedResponse", format!("{}: {}", op, e)))
    }
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum DocumentPayload<'a> {
    Object { store: &'a str, path: &'a str },
    Bytes(String),
}

impl<'a> DocumentPayload<'a> {
    fn from_doc(doc: &'a DocumentRef) -> Self {
        match doc {
            DocumentRef::Stored { locator: loc, .. } => Self::Object {
                store: &loc.store,
                path: &loc.path,
            },
            DocumentRef::Bytes { data, .. } => Self::Bytes(BASE64.encode(data)),
        }
    }
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    document: DocumentPayload<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feature_types: Option<&'a [AnalysisFeature]>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct ServiceErrorBody {
    #[serde(alias = "__type")]
    code: String,
    #[serde(default, alias = "Message")]
    message: String,
}

// ── Service implementation ──────────────────────────────────────────────────

#[async_trait::async_trait]
impl DetectionService for HttpDetectionClient {
    async fn detect(&self, doc: &DocumentRef) -> Result<DetectResponse, BackendError> {
        info!("HttpDetectionClient: detect {}", doc.display_name());
        let body = DetectRequest {
            document: DocumentPayload::from_doc(doc),
            feature_types: None,
        };
        self.send("detect", self.client.post(format!("{}/detect", self.base_url)).json(&body))
            .await
    }

    async fn analyze(
        &self,
        doc: &DocumentRef,
        features: &[AnalysisFeature],
    ) -> Result<DetectResponse, BackendError> {
        info!(
            "HttpDetectionClient: analyze {} with {:?}",
            doc.display_name(),
            features
        );
        let body = DetectRequest {
            document: DocumentPayload::from_doc(doc),
            feature_types: Some(features),
        };
        self.send("analyze", self.client.post(format!("{}/analyze", self.base_url)).json(&body))
            .await
    }

    async fn submit(&self, doc: &DocumentRef) -> Result<String, BackendError> {
        let body = DetectRequest {
            document: DocumentPayload::from_doc(doc),
            feature_types: None,
        };
        let submitted: SubmitResponse = self
            .send("submit", self.client.post(format!("{}/jobs", self.base_url)).json(&body))
            .await?;
        info!("HttpDetectionClient: submitted job {}", submitted.job_id);
        Ok(submitted.job_id)
    }

    async fn poll(&self, job_id: &str, next_token: Option<&str>) -> Result<JobPage, BackendError> {
        let mut request = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, urlencoding::encode(job_id)));
        if let Some(token) = next_token {
            request = request.query(&[("next_token", token)]);
        }
        self.send("poll", request).await
    }
}

// ── Error classification ────────────────────────────────────────────────────

async fn check_status(op: &str, response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ServiceErrorBody>(&text) {
        Ok(body) => (body.code, body.message),
        Err(_) => (format!("Http{}", status.as_u16()), text),
    };
    Err(classify_service_error(
        Some(status.as_u16()),
        &code,
        &format!("{} failed: {}", op, message),
    ))
}

fn transport_error(op: &str, err: reqwest::Error) -> BackendError {
    let message = format!("{} request failed: {}", op, err);
    if err.is_timeout() || err.is_connect() || err.is_request() {
        BackendError::retryable("Transport", message)
    } else {
        BackendError::fatal("Transport", message)
    }
}

/// Map a service error code (and HTTP status when known) onto the taxonomy.
pub fn classify_service_error(status: Option<u16>, code: &str, message: &str) -> BackendError {
    // Codes may arrive namespaced, e.g. "com.amazonaws#ThrottlingException".
    let code = code.rsplit('#').next().unwrap_or(code);
    match code {
        "DocumentTooLargeException" => BackendError::too_large(code, message),
        "ThrottlingException"
        | "ProvisionedThroughputExceededException"
        | "LimitExceededException"
        | "InternalServerError"
        | "ServiceUnavailableException" => BackendError::retryable(code, message),
        "InvalidDocumentException"
        | "UnsupportedDocumentException"
        | "BadDocumentException"
        | "AccessDeniedException"
        | "InvalidS3ObjectException"
        | "InvalidParameterException"
        | "InvalidJobIdException" => BackendError::fatal(code, message),
        _ => match status {
            Some(413) => BackendError::too_large(code, message),
            Some(429) => BackendError::retryable(code, message),
            Some(s) if s >= 500 => BackendError::retryable(code, message),
            _ => BackendError::fatal(code, message),
        },
    }
}

fn floor_char_boundary(text: &str, max: usize) -> usize {
    let mut end = max.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}
