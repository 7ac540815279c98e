//! Report Extractor - resilient PDF text extraction and SOC 2 report review server.

mod analysis;
mod config;
mod document;
mod error;
mod event;
mod notify;
mod ocr;
mod openrouter;
mod orchestrator;
mod pipeline;
mod record;
mod retry;
mod store;

use analysis::LlmAnalyzer;
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use config::Settings;
use error::PipelineError;
use notify::{LogNotifier, Notifier, WebhookNotifier};
use ocr::{DetectionService, HttpDetectionClient};
use openrouter::OpenRouterClient;
use orchestrator::ExtractionOrchestrator;
use pipeline::{PipelineOptions, PipelineOutcome, ReportPipeline, UploadExtraction};
use serde_json::Value;
use std::sync::Arc;
use store::{BlobStore, FsBlobStore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<ReportPipeline>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "report_extractor=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Loads .env, then EXTRACTOR_CONFIG, then environment overrides
    let settings = Settings::load()?;

    let blob_store = FsBlobStore::new(settings.blob_root.clone());
    info!("Blob store rooted at {}", blob_store.root().display());
    let store: Arc<dyn BlobStore> = Arc::new(blob_store);

    let detection: Option<Arc<dyn DetectionService>> = match &settings.detection.url {
        Some(url) => {
            let client = HttpDetectionClient::new(
                url.clone(),
                settings.detection.api_key.clone(),
                settings.detection.timeout(),
            )?;
            info!("Detection service at {}", url);
            Some(Arc::new(client))
        }
        None => None,
    };

    // Building the chain runs the local OCR tool's version check, which blocks.
    let extractor = ExtractionOrchestrator::build(&settings, detection, Arc::clone(&store)).await?;

    let openrouter = OpenRouterClient::from_env()?.with_model(settings.analysis.model.clone());
    info!("OpenRouter client initialized ({})", openrouter.model());
    let analyzer = LlmAnalyzer::new(
        openrouter,
        settings.analysis.max_input_chars,
        settings.retry.into(),
    );

    let notifier: Arc<dyn Notifier> = match &settings.notification.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let pipeline = ReportPipeline::new(
        store,
        extractor,
        Arc::new(analyzer),
        notifier,
        PipelineOptions::from(&settings),
    );
    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract_document))
        .route("/events", post(handle_event))
        .layer(DefaultBodyLimit::max(settings.max_document_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

fn reject(e: PipelineError) -> (StatusCode, String) {
    error!("{}: {}", e.kind(), e);
    (e.status_code(), format!("{}: {}", e.kind(), e))
}

/// Upload a PDF and run it through the extraction chain.
async fn extract_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadExtraction>, (StatusCode, String)> {
    let mut filename = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("document.pdf").to_string();
            file_data = field.bytes().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
            })?.to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }

    info!("Received file: {} ({} bytes)", filename, file_data.len());

    let extraction = state
        .pipeline
        .extract_upload(&filename, file_data)
        .await
        .map_err(reject)?;

    info!(
        "Extracted {} chars from {} via {}",
        extraction.text.content.len(),
        filename,
        extraction.text.source_backend
    );
    Ok(Json(extraction))
}

/// Process an upload notification end to end.
async fn handle_event(
    State(state): State<AppState>,
    Json(event): Json<Value>,
) -> Result<Json<PipelineOutcome>, (StatusCode, String)> {
    let outcome = state.pipeline.handle_event(&event).await.map_err(reject)?;
    info!("Run {} complete: {}", outcome.run_id, outcome.result_uri);
    Ok(Json(outcome))
}
